//! Entity descriptors and the rule-driven tree serializer.
//!
//! Every entity type declares an ordered field list plus a deny list of
//! dotted paths. The deny lists are the hand-authored cycle-breaking
//! contract: serializing an entity walks its declared fields, descends
//! into relationship fields, and prunes exactly the paths the rules name.
//! There is no general cycle detection; the walk is bounded because the
//! rules cut every inverse edge.

use crate::error::{Result, StoreError};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{Map, Number, Value};

/// The three persisted entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Customer,
    Item,
    Review,
}

/// How a declared field is produced.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    /// Plain column on the entity's own table.
    Scalar,
    /// Single parent row reached through the `fk` column on this entity.
    BelongsTo {
        target: EntityKind,
        fk: &'static str,
    },
    /// Child rows whose `fk` column points back at this entity.
    HasMany {
        target: EntityKind,
        fk: &'static str,
    },
}

/// A named field in an entity's serialized form.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// Declarative description of one entity type: its table, the fields its
/// serialized form carries, and the dotted paths serialization must never
/// expand when starting from this type.
#[derive(Debug)]
pub struct EntityDef {
    pub kind: EntityKind,
    pub entity: &'static str,
    pub table: &'static str,
    pub fields: &'static [FieldDef],
    pub deny: &'static [&'static str],
}

pub static CUSTOMER_DEF: EntityDef = EntityDef {
    kind: EntityKind::Customer,
    entity: "customer",
    table: "customers",
    fields: &[
        FieldDef {
            name: "id",
            kind: FieldKind::Scalar,
        },
        FieldDef {
            name: "name",
            kind: FieldKind::Scalar,
        },
        FieldDef {
            name: "reviews",
            kind: FieldKind::HasMany {
                target: EntityKind::Review,
                fk: "customer_id",
            },
        },
    ],
    // A customer's nested reviews must not expand back into the customer
    deny: &["reviews.customer"],
};

pub static ITEM_DEF: EntityDef = EntityDef {
    kind: EntityKind::Item,
    entity: "item",
    table: "items",
    fields: &[
        FieldDef {
            name: "id",
            kind: FieldKind::Scalar,
        },
        FieldDef {
            name: "name",
            kind: FieldKind::Scalar,
        },
        FieldDef {
            name: "price",
            kind: FieldKind::Scalar,
        },
        FieldDef {
            name: "reviews",
            kind: FieldKind::HasMany {
                target: EntityKind::Review,
                fk: "item_id",
            },
        },
    ],
    // An item's nested reviews must not expand back into the item
    deny: &["reviews.item"],
};

pub static REVIEW_DEF: EntityDef = EntityDef {
    kind: EntityKind::Review,
    entity: "review",
    table: "reviews",
    fields: &[
        FieldDef {
            name: "id",
            kind: FieldKind::Scalar,
        },
        FieldDef {
            name: "comment",
            kind: FieldKind::Scalar,
        },
        FieldDef {
            name: "customer_id",
            kind: FieldKind::Scalar,
        },
        FieldDef {
            name: "item_id",
            kind: FieldKind::Scalar,
        },
        FieldDef {
            name: "customer",
            kind: FieldKind::BelongsTo {
                target: EntityKind::Customer,
                fk: "customer_id",
            },
        },
        FieldDef {
            name: "item",
            kind: FieldKind::BelongsTo {
                target: EntityKind::Item,
                fk: "item_id",
            },
        },
    ],
    // A review's nested parents must not expand their review collections
    deny: &["customer.reviews", "item.reviews"],
};

pub fn def_for(kind: EntityKind) -> &'static EntityDef {
    match kind {
        EntityKind::Customer => &CUSTOMER_DEF,
        EntityKind::Item => &ITEM_DEF,
        EntityKind::Review => &REVIEW_DEF,
    }
}

/// Check every deny path of every entity type against the declared
/// fields. Runs at schema definition time so a malformed rule fails fast
/// instead of surfacing mid-serialization.
pub(crate) fn validate_defs() -> Result<()> {
    for def in [&CUSTOMER_DEF, &ITEM_DEF, &REVIEW_DEF] {
        validate_def(def)?;
    }
    Ok(())
}

fn validate_def(def: &EntityDef) -> Result<()> {
    for rule in def.deny {
        validate_path(def, rule)?;
    }
    Ok(())
}

// Resolve a dotted deny path segment by segment through the field
// declarations, hopping to the related type's descriptor at each
// relationship field.
fn validate_path(def: &EntityDef, rule: &str) -> Result<()> {
    let segments: Vec<&str> = rule.split('.').collect();
    let mut current = def;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            return Err(invalid_rule(def, rule, "empty path segment".to_string()));
        }
        let field = match current.fields.iter().find(|f| f.name == *segment) {
            Some(field) => field,
            None => {
                let reason = format!("no field named '{}' on {}", segment, current.entity);
                return Err(invalid_rule(def, rule, reason));
            }
        };
        let last = i + 1 == segments.len();
        match field.kind {
            FieldKind::Scalar if !last => {
                let reason = format!("'{}' is a scalar and has no nested fields", segment);
                return Err(invalid_rule(def, rule, reason));
            }
            FieldKind::Scalar => {}
            FieldKind::BelongsTo { target, .. } | FieldKind::HasMany { target, .. } => {
                current = def_for(target);
            }
        }
    }
    Ok(())
}

fn invalid_rule(def: &EntityDef, rule: &str, reason: String) -> StoreError {
    StoreError::InvalidRule {
        entity: def.entity,
        rule: rule.to_string(),
        reason,
    }
}

/// One active deny rule, tracked as the path segments still ahead of the
/// walker's current position.
type Cursor = Vec<&'static str>;

fn mount(deny: &'static [&'static str]) -> Vec<Cursor> {
    deny.iter().map(|rule| rule.split('.').collect()).collect()
}

// A field is pruned when some active rule has exactly that field left.
fn denied(cursors: &[Cursor], field: &str) -> bool {
    cursors.iter().any(|c| c.len() == 1 && c[0] == field)
}

// Advance the cursors one level into `field`, and mount the target
// type's own rules at the new position. The mounting is what keeps the
// walk bounded: every type re-asserts its inverse-edge exclusions
// wherever it appears in the tree.
fn descend(cursors: &[Cursor], field: &str, target: &'static EntityDef) -> Vec<Cursor> {
    let mut next: Vec<Cursor> = cursors
        .iter()
        .filter(|c| c.len() > 1 && c[0] == field)
        .map(|c| c[1..].to_vec())
        .collect();
    next.extend(mount(target.deny));
    next
}

/// Serialize one entity as a JSON value with its type's exclusion rules
/// applied. Unknown ids surface the entity's not-found error.
pub(crate) fn serialize_entity(conn: &Connection, kind: EntityKind, id: i64) -> Result<Value> {
    let def = def_for(kind);
    walk(conn, def, id, &mount(def.deny))
}

fn walk(conn: &Connection, def: &'static EntityDef, id: i64, cursors: &[Cursor]) -> Result<Value> {
    let row = match fetch_scalars(conn, def, id)? {
        Some(row) => row,
        None => return Err(not_found(def.kind, id)),
    };
    let mut out = Map::new();
    for field in def.fields {
        if denied(cursors, field.name) {
            continue;
        }
        match field.kind {
            FieldKind::Scalar => {
                let value = row.get(field.name).cloned().unwrap_or(Value::Null);
                out.insert(field.name.to_string(), value);
            }
            FieldKind::BelongsTo { target, fk } => {
                let parent = def_for(target);
                let parent_id = row
                    .get(fk)
                    .and_then(Value::as_i64)
                    .ok_or(StoreError::BrokenReference)?;
                let sub = descend(cursors, field.name, parent);
                out.insert(field.name.to_string(), walk(conn, parent, parent_id, &sub)?);
            }
            FieldKind::HasMany { target, fk } => {
                let child = def_for(target);
                let sub = descend(cursors, field.name, child);
                let mut children = Vec::new();
                for child_id in child_ids(conn, child, fk, id)? {
                    children.push(walk(conn, child, child_id, &sub)?);
                }
                out.insert(field.name.to_string(), Value::Array(children));
            }
        }
    }
    Ok(Value::Object(out))
}

// Read the declared scalar columns of one row into a name → JSON map.
fn fetch_scalars(
    conn: &Connection,
    def: &EntityDef,
    id: i64,
) -> Result<Option<Map<String, Value>>> {
    let columns: Vec<&str> = def
        .fields
        .iter()
        .filter(|f| matches!(f.kind, FieldKind::Scalar))
        .map(|f| f.name)
        .collect();
    let sql = format!(
        "SELECT {} FROM {} WHERE id = ?",
        columns.join(", "),
        def.table
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => {
            let mut map = Map::new();
            for (idx, column) in columns.iter().enumerate() {
                map.insert(column.to_string(), column_value(row.get_ref(idx)?));
            }
            Ok(Some(map))
        }
        None => Ok(None),
    }
}

fn column_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Number(n.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}

// Child row ids in attach order (review ids are assigned monotonically).
fn child_ids(conn: &Connection, child: &EntityDef, fk: &str, parent_id: i64) -> Result<Vec<i64>> {
    let sql = format!(
        "SELECT id FROM {} WHERE {} = ? ORDER BY id",
        child.table, fk
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([parent_id], |row| row.get(0))?;
    let mut ids = Vec::new();
    for id in rows {
        ids.push(id?);
    }
    Ok(ids)
}

fn not_found(kind: EntityKind, id: i64) -> StoreError {
    match kind {
        EntityKind::Customer => StoreError::CustomerNotFound(id),
        EntityKind::Item => StoreError::ItemNotFound(id),
        EntityKind::Review => StoreError::ReviewNotFound(id),
    }
}
