//! Visitor boundary to and from the rest of the import pipeline.

use crate::types::{Result, StageError};
use crate::values::Value;

use super::group::Group;

/// Receives the fields of one entity at a time, finished by
/// [`InputEntityVisitor::end_of_entity`].
///
/// Properties come first (either key/value pairs or a property-chain
/// pointer), then the entity-specific fields.
pub trait InputEntityVisitor {
    /// One property. [`Value::Null`] means the property is absent.
    fn property(&mut self, key: &str, value: Value) {
        let _ = (key, value);
    }

    /// Pointer into an already materialized property chain.
    fn property_id(&mut self, first_property_id: i64) {
        let _ = first_property_id;
    }

    /// Node id within its group. [`Value::Null`] when the node has no id.
    fn id(&mut self, id: Value, group: &Group) {
        let _ = (id, group);
    }

    /// Full label set of a node.
    fn labels(&mut self, labels: &[String]) {
        let _ = labels;
    }

    /// Pre-packed label field of a node.
    fn label_field(&mut self, label_field: i64) {
        let _ = label_field;
    }

    /// Explicit relationship id.
    fn relationship_id(&mut self, id: i64) {
        let _ = id;
    }

    /// Start node id of a relationship.
    fn start_id(&mut self, id: Value, group: &Group) {
        let _ = (id, group);
    }

    /// End node id of a relationship.
    fn end_id(&mut self, id: Value, group: &Group) {
        let _ = (id, group);
    }

    /// Relationship type by name.
    fn rel_type(&mut self, name: &str) {
        let _ = name;
    }

    /// Relationship type by token id.
    fn type_id(&mut self, type_id: i32) {
        let _ = type_id;
    }

    /// Closes the current entity.
    fn end_of_entity(&mut self) -> Result<()>;
}

/// Which stream an entity belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum EntityKind {
    /// Node stream.
    Node,
    /// Relationship stream.
    Relationship,
}

/// Inline properties or a property-chain pointer, never both.
#[derive(Clone, Debug, PartialEq)]
pub enum Properties {
    /// Key/value pairs in visiting order.
    Inline(Vec<(String, Value)>),
    /// First record of an existing property chain.
    FirstPropertyId(i64),
}

impl Default for Properties {
    fn default() -> Self {
        Properties::Inline(Vec::new())
    }
}

/// Label set or packed label field.
#[derive(Clone, Debug, PartialEq)]
pub enum Labels {
    /// Label names.
    Names(Vec<String>),
    /// Packed label field.
    Field(i64),
}

/// Relationship type as a name, a token id, or missing.
#[derive(Clone, Debug, PartialEq)]
pub enum RelType {
    /// No type was visited.
    Missing,
    /// Type name.
    Name(String),
    /// Type token id.
    Id(i32),
}

/// Decoded node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRecord {
    /// Properties.
    pub properties: Properties,
    /// Id value, [`Value::Null`] if absent.
    pub id: Value,
    /// Id space of `id`.
    pub group: Group,
    /// Labels.
    pub labels: Labels,
}

/// Decoded relationship.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationshipRecord {
    /// Properties.
    pub properties: Properties,
    /// Explicit id, if any.
    pub id: Option<i64>,
    /// Start node id.
    pub start_id: Value,
    /// Id space of `start_id`.
    pub start_group: Group,
    /// End node id.
    pub end_id: Value,
    /// Id space of `end_id`.
    pub end_group: Group,
    /// Type.
    pub rel_type: RelType,
}

/// One fully visited entity.
#[derive(Clone, Debug, PartialEq)]
pub enum EntityRecord {
    /// A node.
    Node(NodeRecord),
    /// A relationship.
    Relationship(RelationshipRecord),
}

impl EntityRecord {
    /// Stream this record belongs to.
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRecord::Node(_) => EntityKind::Node,
            EntityRecord::Relationship(_) => EntityKind::Relationship,
        }
    }

    /// Emits this record as visitor calls, including the closing
    /// [`InputEntityVisitor::end_of_entity`].
    pub fn replay(&self, visitor: &mut dyn InputEntityVisitor) -> Result<()> {
        let properties = match self {
            EntityRecord::Node(n) => &n.properties,
            EntityRecord::Relationship(r) => &r.properties,
        };
        match properties {
            Properties::Inline(props) => {
                for (key, value) in props {
                    visitor.property(key, value.clone());
                }
            }
            Properties::FirstPropertyId(id) => visitor.property_id(*id),
        }
        match self {
            EntityRecord::Node(node) => {
                visitor.id(node.id.clone(), &node.group);
                match &node.labels {
                    Labels::Names(names) => visitor.labels(names),
                    Labels::Field(field) => visitor.label_field(*field),
                }
            }
            EntityRecord::Relationship(rel) => {
                if let Some(id) = rel.id {
                    visitor.relationship_id(id);
                }
                visitor.start_id(rel.start_id.clone(), &rel.start_group);
                visitor.end_id(rel.end_id.clone(), &rel.end_group);
                match &rel.rel_type {
                    RelType::Missing => {}
                    RelType::Name(name) => visitor.rel_type(name),
                    RelType::Id(id) => visitor.type_id(*id),
                }
            }
        }
        visitor.end_of_entity()
    }
}

/// Visitor that records everything it is told about one entity.
#[derive(Clone, Debug, Default)]
pub struct InputEntity {
    properties: Vec<(String, Value)>,
    first_property_id: Option<i64>,
    id: Option<(Value, Group)>,
    labels: Vec<String>,
    label_field: Option<i64>,
    relationship_id: Option<i64>,
    start: Option<(Value, Group)>,
    end: Option<(Value, Group)>,
    rel_type: Option<String>,
    type_id: Option<i32>,
    ended: bool,
}

impl InputEntity {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets everything collected so far.
    pub fn clear(&mut self) {
        self.properties.clear();
        self.first_property_id = None;
        self.id = None;
        self.labels.clear();
        self.label_field = None;
        self.relationship_id = None;
        self.start = None;
        self.end = None;
        self.rel_type = None;
        self.type_id = None;
        self.ended = false;
    }

    /// Returns true once `end_of_entity` has been seen.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Collected properties.
    pub fn properties(&self) -> &[(String, Value)] {
        &self.properties
    }

    /// Collected relationship type name.
    pub fn rel_type_name(&self) -> Option<&str> {
        self.rel_type.as_deref()
    }

    /// Collected relationship type id.
    pub fn rel_type_id(&self) -> Option<i32> {
        self.type_id
    }

    /// Converts the collected fields into a record of the given kind.
    pub fn to_record(&self, kind: EntityKind) -> Result<EntityRecord> {
        let properties = match self.first_property_id {
            Some(_) if !self.properties.is_empty() => {
                return Err(StageError::invalid(
                    "entity has both inline properties and a first property id",
                ))
            }
            Some(id) => Properties::FirstPropertyId(id),
            None => Properties::Inline(self.properties.clone()),
        };
        let id_or_null = |slot: &Option<(Value, Group)>| -> (Value, Group) {
            slot.clone().unwrap_or((Value::Null, Group::global()))
        };
        let record = match kind {
            EntityKind::Node => {
                let labels = match self.label_field {
                    Some(_) if !self.labels.is_empty() => {
                        return Err(StageError::invalid(
                            "node has both label names and a label field",
                        ))
                    }
                    Some(field) => Labels::Field(field),
                    None => Labels::Names(self.labels.clone()),
                };
                let (id, group) = id_or_null(&self.id);
                EntityRecord::Node(NodeRecord {
                    properties,
                    id,
                    group,
                    labels,
                })
            }
            EntityKind::Relationship => {
                let rel_type = match (&self.rel_type, self.type_id) {
                    (Some(_), Some(_)) => {
                        return Err(StageError::invalid(
                            "relationship has both a type name and a type id",
                        ))
                    }
                    (Some(name), None) => RelType::Name(name.clone()),
                    (None, Some(id)) => RelType::Id(id),
                    (None, None) => RelType::Missing,
                };
                let (start_id, start_group) = id_or_null(&self.start);
                let (end_id, end_group) = id_or_null(&self.end);
                EntityRecord::Relationship(RelationshipRecord {
                    properties,
                    id: self.relationship_id,
                    start_id,
                    start_group,
                    end_id,
                    end_group,
                    rel_type,
                })
            }
        };
        Ok(record)
    }
}

impl InputEntityVisitor for InputEntity {
    fn property(&mut self, key: &str, value: Value) {
        self.properties.push((key.to_owned(), value));
    }

    fn property_id(&mut self, first_property_id: i64) {
        self.first_property_id = Some(first_property_id);
    }

    fn id(&mut self, id: Value, group: &Group) {
        self.id = Some((id, group.clone()));
    }

    fn labels(&mut self, labels: &[String]) {
        self.labels.extend(labels.iter().cloned());
    }

    fn label_field(&mut self, label_field: i64) {
        self.label_field = Some(label_field);
    }

    fn relationship_id(&mut self, id: i64) {
        self.relationship_id = Some(id);
    }

    fn start_id(&mut self, id: Value, group: &Group) {
        self.start = Some((id, group.clone()));
    }

    fn end_id(&mut self, id: Value, group: &Group) {
        self.end = Some((id, group.clone()));
    }

    fn rel_type(&mut self, name: &str) {
        self.rel_type = Some(name.to_owned());
    }

    fn type_id(&mut self, type_id: i32) {
        self.type_id = Some(type_id);
    }

    fn end_of_entity(&mut self) -> Result<()> {
        self.ended = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_reproduces_node() {
        let mut first = InputEntity::new();
        first.property("name", Value::from("alice"));
        first.id(Value::Long(7), &Group::new(1, Some("people")));
        first.labels(&["Person".to_owned()]);
        first.end_of_entity().unwrap();
        let record = first.to_record(EntityKind::Node).unwrap();

        let mut second = InputEntity::new();
        record.replay(&mut second).unwrap();
        assert!(second.is_ended());
        assert_eq!(second.to_record(EntityKind::Node).unwrap(), record);
    }

    #[test]
    fn both_property_forms_are_rejected() {
        let mut entity = InputEntity::new();
        entity.property("k", Value::Int(1));
        entity.property_id(42);
        assert!(matches!(
            entity.to_record(EntityKind::Node),
            Err(StageError::Invalid(_))
        ));
    }

    #[test]
    fn both_type_forms_are_rejected() {
        let mut entity = InputEntity::new();
        entity.rel_type("KNOWS");
        entity.type_id(3);
        assert!(entity.to_record(EntityKind::Relationship).is_err());
    }

    #[test]
    fn missing_ids_default_to_null_in_global_group() {
        let record = InputEntity::new()
            .to_record(EntityKind::Relationship)
            .unwrap();
        let EntityRecord::Relationship(rel) = record else {
            panic!("expected relationship");
        };
        assert!(rel.start_id.is_null());
        assert!(rel.end_group.is_global());
        assert_eq!(rel.rel_type, RelType::Missing);
    }

    #[test]
    fn clear_resets_state() {
        let mut entity = InputEntity::new();
        entity.rel_type("T");
        entity.end_of_entity().unwrap();
        entity.clear();
        assert!(!entity.is_ended());
        assert_eq!(entity.rel_type_name(), None);
    }
}
