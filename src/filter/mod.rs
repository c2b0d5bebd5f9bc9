//! Structured filter expressions.
//!
//! Unlike an opaque `filter` closure, a [`FilterExpression`] can be inspected:
//! the optimizer derives cheap tag pre-filters and a narrowed type set from it
//! before any geometry is built. The expression itself is still evaluated on
//! every item afterwards, so the optimizer only ever skips work.
//!
//! Expressions are kept in negation normal form: [`FilterExpression::negate`]
//! pushes negation down to the leaves instead of wrapping a `Not` node.
//!
//! ```
//! use histbeam::FilterExpression;
//! let f: FilterExpression = "building=* and not type:node".parse()?;
//! assert_eq!(f.to_string(), "(building=* and type:way,relation)");
//! # Ok::<_, histbeam::Error>(())
//! ```

mod optimizer;
mod parser;

pub use optimizer::{OptimizedFilter, optimize};

use crate::geometry::{GeometryKind, kind_of};
use crate::osm::{OsmEntity, OsmTypeSet};
use geo::Geometry;
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FilterExpression {
    Constant(bool),
    And(Box<FilterExpression>, Box<FilterExpression>),
    Or(Box<FilterExpression>, Box<FilterExpression>),
    TagExists { key: String },
    TagNotExists { key: String },
    TagEquals { key: String, value: String },
    TagNotEquals { key: String, value: String },
    TagEqualsAny { key: String, values: Vec<String> },
    TagNotEqualsAny { key: String, values: Vec<String> },
    Type(OsmTypeSet),
    GeometryType(GeometryKind),
    NotGeometryType(GeometryKind),
    Id(i64),
    IdNot(i64),
}

use FilterExpression as F;

impl FilterExpression {
    pub fn parse(input: &str) -> crate::Result<Self> {
        parser::parse(input)
    }

    #[must_use]
    pub fn tag(key: impl Into<String>, value: impl Into<String>) -> Self {
        F::TagEquals {
            key: key.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn tag_key(key: impl Into<String>) -> Self {
        F::TagExists { key: key.into() }
    }

    #[must_use]
    pub fn tag_any<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        F::TagEqualsAny {
            key: key.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        F::And(Box::new(self), Box::new(other))
    }

    #[must_use]
    pub fn or(self, other: Self) -> Self {
        F::Or(Box::new(self), Box::new(other))
    }

    /// Logical negation, applied with De Morgan's laws down to the leaves.
    #[must_use]
    pub fn negate(&self) -> Self {
        match self {
            F::Constant(b) => F::Constant(!b),
            F::And(a, b) => a.negate().or(b.negate()),
            F::Or(a, b) => a.negate().and(b.negate()),
            F::TagExists { key } => F::TagNotExists { key: key.clone() },
            F::TagNotExists { key } => F::TagExists { key: key.clone() },
            F::TagEquals { key, value } => F::TagNotEquals {
                key: key.clone(),
                value: value.clone(),
            },
            F::TagNotEquals { key, value } => F::TagEquals {
                key: key.clone(),
                value: value.clone(),
            },
            F::TagEqualsAny { key, values } => F::TagNotEqualsAny {
                key: key.clone(),
                values: values.clone(),
            },
            F::TagNotEqualsAny { key, values } => F::TagEqualsAny {
                key: key.clone(),
                values: values.clone(),
            },
            F::Type(types) => F::Type(types.complement()),
            F::GeometryType(kind) => F::NotGeometryType(*kind),
            F::NotGeometryType(kind) => F::GeometryType(*kind),
            F::Id(id) => F::IdNot(*id),
            F::IdNot(id) => F::Id(*id),
        }
    }

    /// Evaluate against one entity state and its geometry.
    #[must_use]
    pub fn applies(&self, entity: &OsmEntity, geometry: &Geometry<f64>) -> bool {
        match self {
            F::Constant(b) => *b,
            F::And(a, b) => a.applies(entity, geometry) && b.applies(entity, geometry),
            F::Or(a, b) => a.applies(entity, geometry) || b.applies(entity, geometry),
            F::GeometryType(kind) => kind_of(geometry) == *kind,
            F::NotGeometryType(kind) => kind_of(geometry) != *kind,
            leaf => leaf.applies_to_tags(entity).unwrap_or(true),
        }
    }

    /// Evaluate a leaf that needs no geometry; `None` for every other node.
    pub(crate) fn applies_to_tags(&self, entity: &OsmEntity) -> Option<bool> {
        let hit = match self {
            F::TagExists { key } => entity.has_tag_key(key),
            F::TagNotExists { key } => !entity.has_tag_key(key),
            F::TagEquals { key, value } => entity.has_tag(key, value),
            F::TagNotEquals { key, value } => !entity.has_tag(key, value),
            F::TagEqualsAny { key, values } => {
                entity.tag(key).is_some_and(|v| values.iter().any(|x| x == v))
            }
            F::TagNotEqualsAny { key, values } => {
                !entity.tag(key).is_some_and(|v| values.iter().any(|x| x == v))
            }
            F::Type(types) => types.contains(entity.osm_type),
            F::Id(id) => entity.id == *id,
            F::IdNot(id) => entity.id != *id,
            _ => return None,
        };
        Some(hit)
    }

    /// Disjunctive normal form: a list of clauses, each a conjunction of leaves.
    ///
    /// `Constant(true)` becomes one empty clause, `Constant(false)` no clause.
    #[must_use]
    pub fn to_dnf(&self) -> Vec<Vec<FilterExpression>> {
        match self {
            F::Constant(true) => vec![Vec::new()],
            F::Constant(false) => Vec::new(),
            F::Or(a, b) => {
                let mut clauses = a.to_dnf();
                clauses.extend(b.to_dnf());
                clauses
            }
            F::And(a, b) => {
                let right = b.to_dnf();
                a.to_dnf()
                    .into_iter()
                    .flat_map(|l| {
                        right.iter().map(move |r| {
                            let mut clause = l.clone();
                            clause.extend(r.iter().cloned());
                            clause
                        })
                    })
                    .collect()
            }
            leaf => vec![vec![leaf.clone()]],
        }
    }

    /// Upper bound on the number of DNF clauses, saturating.
    pub(crate) fn dnf_size(&self) -> usize {
        match self {
            F::Constant(false) => 0,
            F::Or(a, b) => a.dnf_size().saturating_add(b.dnf_size()),
            F::And(a, b) => a.dnf_size().saturating_mul(b.dnf_size()),
            _ => 1,
        }
    }
}

impl FromStr for FilterExpression {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        parser::parse(s)
    }
}

fn write_text(f: &mut Formatter<'_>, s: &str) -> FormatResult {
    if parser::is_bare_word(s) {
        f.write_str(s)
    } else {
        write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

fn geometry_name(kind: GeometryKind) -> &'static str {
    match kind {
        GeometryKind::Point => "point",
        GeometryKind::Line => "line",
        GeometryKind::Polygon => "polygon",
        GeometryKind::Other => "other",
    }
}

impl Display for FilterExpression {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            F::Constant(b) => write!(f, "{b}"),
            F::And(a, b) => write!(f, "({a} and {b})"),
            F::Or(a, b) => write!(f, "({a} or {b})"),
            F::TagExists { key } => {
                write_text(f, key)?;
                f.write_str("=*")
            }
            F::TagNotExists { key } => {
                write_text(f, key)?;
                f.write_str("!=*")
            }
            F::TagEquals { key, value } | F::TagNotEquals { key, value } => {
                write_text(f, key)?;
                f.write_str(if matches!(self, F::TagEquals { .. }) { "=" } else { "!=" })?;
                write_text(f, value)
            }
            F::TagEqualsAny { key, values } | F::TagNotEqualsAny { key, values } => {
                if matches!(self, F::TagNotEqualsAny { .. }) {
                    f.write_str("not ")?;
                }
                write_text(f, key)?;
                f.write_str(" in (")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_text(f, v)?;
                }
                f.write_str(")")
            }
            F::Type(types) if types.is_empty() => f.write_str("false"),
            F::Type(types) => {
                let names: Vec<String> = types.iter().map(|t| t.to_string()).collect();
                write!(f, "type:{}", names.join(","))
            }
            F::GeometryType(kind) => write!(f, "geometry:{}", geometry_name(*kind)),
            F::NotGeometryType(kind) => write!(f, "not geometry:{}", geometry_name(*kind)),
            F::Id(id) => write!(f, "id:{id}"),
            F::IdNot(id) => write!(f, "not id:{id}"),
        }
    }
}
