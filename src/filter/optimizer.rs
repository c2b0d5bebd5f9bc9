//! Derive cheap pre-filters from a structured filter.
//!
//! Two independent passes, each of which may only narrow the search:
//!
//! 1. Walk the top-level conjunction. Positive tag terms become a history
//!    pre-filter (some version carries the tag) and an entity filter (this
//!    version carries it); type terms intersect the active type set.
//! 2. Expand to DNF, intersect the types each clause admits, union across
//!    clauses and intersect the active set with the result. Only `type:`
//!    terms take part: a geometry kind depends on how the collaborator
//!    resolved the entity, so it says nothing certain about its type.
//!
//! The result is a hint. The full expression still decides every item.

use super::FilterExpression as F;
use crate::collaborator::{EntityPredicate, HistoryPredicate};
use crate::osm::OsmTypeSet;
use std::sync::Arc;
use tracing::debug;

/// Expansions beyond this many clauses skip the type-narrowing pass.
const MAX_DNF_CLAUSES: usize = 1024;

#[derive(Clone)]
pub struct OptimizedFilter {
    pub types: OsmTypeSet,
    pub pre_filter: HistoryPredicate,
    pub filter: EntityPredicate,
}

impl std::fmt::Debug for OptimizedFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizedFilter")
            .field("types", &self.types)
            .finish_non_exhaustive()
    }
}

pub fn optimize(expr: Option<&F>, types: OsmTypeSet) -> OptimizedFilter {
    let Some(expr) = expr else {
        return OptimizedFilter {
            types,
            pre_filter: Arc::new(|_| true),
            filter: Arc::new(|_| true),
        };
    };

    let mut tag_terms = Vec::new();
    let mut types = types;
    collect_conjuncts(expr, &mut tag_terms, &mut types);
    let types = types.intersect(dnf_types(expr));

    debug!(
        filter = %expr,
        ?types,
        tag_terms = tag_terms.len(),
        "optimized filter"
    );

    let terms: Arc<[F]> = tag_terms.into();
    let history_terms = Arc::clone(&terms);
    OptimizedFilter {
        types,
        pre_filter: Arc::new(move |history| {
            history_terms
                .iter()
                .all(|t| history.any_version(|e| t.applies_to_tags(e).unwrap_or(true)))
        }),
        filter: Arc::new(move |entity| {
            terms.iter().all(|t| t.applies_to_tags(entity).unwrap_or(true))
        }),
    }
}

fn collect_conjuncts(expr: &F, tag_terms: &mut Vec<F>, types: &mut OsmTypeSet) {
    match expr {
        F::And(a, b) => {
            collect_conjuncts(a, tag_terms, types);
            collect_conjuncts(b, tag_terms, types);
        }
        F::TagExists { .. } | F::TagEquals { .. } | F::TagEqualsAny { .. } => {
            tag_terms.push(expr.clone());
        }
        F::Type(allowed) => *types = types.intersect(*allowed),
        _ => {}
    }
}

fn dnf_types(expr: &F) -> OsmTypeSet {
    if expr.dnf_size() > MAX_DNF_CLAUSES {
        debug!(filter = %expr, "filter too large for type narrowing");
        return OsmTypeSet::all();
    }
    expr.to_dnf()
        .iter()
        .map(|clause| {
            clause.iter().fold(OsmTypeSet::all(), |acc, term| match term {
                F::Type(allowed) => acc.intersect(*allowed),
                _ => acc,
            })
        })
        .fold(OsmTypeSet::empty(), OsmTypeSet::union)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osm::OsmType;

    #[test]
    fn or_of_typed_clauses_narrows_to_union() {
        let e = F::parse("(type:node and amenity=*) or geometry:polygon").unwrap();
        let o = optimize(Some(&e), OsmTypeSet::all());
        assert_eq!(o.types, OsmTypeSet::all());

        let e = F::parse("(type:node and a=*) or (type:way and b=*)").unwrap();
        let o = optimize(Some(&e), OsmTypeSet::all());
        assert_eq!(o.types, OsmTypeSet::of(OsmType::Node).with(OsmType::Way));
    }

    #[test]
    fn geometry_kinds_do_not_narrow_types() {
        for text in ["geometry:point", "geometry:line and building=*", "not geometry:other"] {
            let e = F::parse(text).unwrap();
            assert_eq!(optimize(Some(&e), OsmTypeSet::all()).types, OsmTypeSet::all(), "{text}");
        }
    }

    #[test]
    fn conjunction_intersects_types() {
        let e = F::parse("type:node,way and highway=* and type:way,relation").unwrap();
        let o = optimize(Some(&e), OsmTypeSet::all());
        assert_eq!(o.types, OsmTypeSet::of(OsmType::Way));
        let o = optimize(Some(&F::Constant(false)), OsmTypeSet::all());
        assert!(o.types.is_empty());
    }
}
