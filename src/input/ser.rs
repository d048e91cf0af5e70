//! Binary entity records.
//!
//! Layout of one entity:
//!
//! ```text
//! properties   i16 count, then count x (i32 key token, value)
//!              | i16 HAS_FIRST_PROPERTY_ID, i64 pointer
//! node         group slot 0, optional id value,
//!              label changes ... END_OF_LABEL_CHANGES | HAS_LABEL_FIELD, i64
//! relationship u8 id flag [i64 id], group slot 0, optional start id,
//!              group slot 1, optional end id,
//!              SAME_TYPE | NEW_TYPE i32 token | HAS_TYPE_ID i32 | NO_TYPE
//! ```
//!
//! A group slot is `SAME_GROUP`, or `NEW_GROUP` followed by the i32 group id
//! and the i32 name token (-1 for the unnamed global group). Labels, groups
//! and the relationship type are diffed against the previous entity of the
//! same chunk; [`DiffState`] holds that and is cleared at every chunk start.
//! A chunk ends with [`END_OF_ENTITIES`] in the property-count position.

use smallvec::SmallVec;

use crate::primitives::bytes::{ReadableChannel, WritableChannel};
use crate::types::{Result, StageError, TokenKind};
use crate::values::{Value, ValueTypes};

use super::entity::{
    EntityKind, EntityRecord, InputEntityVisitor, Labels, NodeRecord, Properties, RelType,
    RelationshipRecord,
};
use super::group::Group;
use super::tokens::{TokenDictionary, TokenTable};

/// Property-count sentinel ending a chunk.
pub const END_OF_ENTITIES: i16 = -3;
/// Property-count sentinel announcing an i64 property-chain pointer.
pub const HAS_FIRST_PROPERTY_ID: i16 = -1;

const SAME_GROUP: u8 = 0;
const NEW_GROUP: u8 = 1;
const NO_GROUP_NAME: i32 = -1;

const END_OF_LABEL_CHANGES: u8 = 0;
const LABEL_REMOVAL: u8 = 1;
const LABEL_ADDITION: u8 = 2;
const HAS_LABEL_FIELD: u8 = 3;

const SAME_TYPE: u8 = 0;
const NEW_TYPE: u8 = 1;
const HAS_TYPE_ID: u8 = 2;
const NO_TYPE: u8 = 3;

const NO_RELATIONSHIP_ID: u8 = 0;
const HAS_RELATIONSHIP_ID: u8 = 1;

const GROUP_SLOTS: usize = 2;

/// Previous-entity state for one chunk, owned by exactly one writer or reader.
#[derive(Clone, Debug, Default)]
pub struct DiffState {
    labels: Vec<String>,
    groups: [Group; GROUP_SLOTS],
    rel_type: Option<String>,
}

impl DiffState {
    /// Creates a cleared state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Back to empty labels, global groups and no type.
    pub fn clear(&mut self) {
        self.labels.clear();
        for slot in &mut self.groups {
            *slot = Group::global();
        }
        self.rel_type = None;
    }
}

/// Appends one record to `out`, allocating tokens through `tokens`.
pub fn write_entity<W: WritableChannel>(
    record: &EntityRecord,
    state: &mut DiffState,
    tokens: &TokenDictionary<W>,
    types: &ValueTypes,
    out: &mut dyn WritableChannel,
) -> Result<()> {
    match record {
        EntityRecord::Node(node) => write_node(node, state, tokens, types, out),
        EntityRecord::Relationship(rel) => write_relationship(rel, state, tokens, types, out),
    }
}

fn write_properties<W: WritableChannel>(
    properties: &Properties,
    tokens: &TokenDictionary<W>,
    types: &ValueTypes,
    out: &mut dyn WritableChannel,
) -> Result<()> {
    match properties {
        Properties::FirstPropertyId(id) => {
            out.put_i16(HAS_FIRST_PROPERTY_ID)?;
            out.put_i64(*id)
        }
        Properties::Inline(props) => {
            let present = props.iter().filter(|(_, v)| !v.is_null()).count();
            let count = i16::try_from(present)
                .map_err(|_| StageError::invalid(format!("{present} properties on one entity")))?;
            out.put_i16(count)?;
            for (key, value) in props.iter().filter(|(_, v)| !v.is_null()) {
                out.put_i32(tokens.get_or_create_id(TokenKind::PropertyKey, key)?)?;
                types.write(value, out)?;
            }
            Ok(())
        }
    }
}

fn write_group<W: WritableChannel>(
    slot: usize,
    group: &Group,
    state: &mut DiffState,
    tokens: &TokenDictionary<W>,
    out: &mut dyn WritableChannel,
) -> Result<()> {
    if state.groups[slot].id() == group.id() {
        return out.put_u8(SAME_GROUP);
    }
    out.put_u8(NEW_GROUP)?;
    out.put_i32(group.id())?;
    let name = match group.name() {
        Some(name) => tokens.get_or_create_id(TokenKind::Group, name)?,
        None => NO_GROUP_NAME,
    };
    out.put_i32(name)?;
    state.groups[slot] = group.clone();
    Ok(())
}

fn write_node<W: WritableChannel>(
    node: &NodeRecord,
    state: &mut DiffState,
    tokens: &TokenDictionary<W>,
    types: &ValueTypes,
    out: &mut dyn WritableChannel,
) -> Result<()> {
    write_properties(&node.properties, tokens, types, out)?;
    write_group(0, &node.group, state, tokens, out)?;
    types.write_optional(Some(&node.id), out)?;
    match &node.labels {
        Labels::Field(field) => {
            out.put_u8(HAS_LABEL_FIELD)?;
            out.put_i64(*field)
        }
        Labels::Names(names) => write_label_changes(names, state, tokens, out),
    }
}

type LabelList<'a> = SmallVec<[&'a str; 4]>;

/// Emits removals then additions turning the previous label set into `names`.
///
/// When plain removal plus appending cannot reproduce the order of `names`,
/// every previous label is removed and the new set is added in full.
fn write_label_changes<W: WritableChannel>(
    names: &[String],
    state: &mut DiffState,
    tokens: &TokenDictionary<W>,
    out: &mut dyn WritableChannel,
) -> Result<()> {
    let mut wanted: LabelList<'_> = SmallVec::with_capacity(names.len());
    for name in names {
        if !wanted.contains(&name.as_str()) {
            wanted.push(name);
        }
    }
    {
        let kept: LabelList<'_> = state
            .labels
            .iter()
            .map(String::as_str)
            .filter(|l| wanted.contains(l))
            .collect();
        let in_order = wanted.starts_with(&kept[..]);
        let (removed, added): (LabelList<'_>, &[&str]) = if in_order {
            let removed: LabelList<'_> = state
                .labels
                .iter()
                .map(String::as_str)
                .filter(|l| !wanted.contains(l))
                .collect();
            (removed, &wanted[kept.len()..])
        } else {
            (state.labels.iter().map(String::as_str).collect(), &wanted[..])
        };
        for label in &removed {
            out.put_u8(LABEL_REMOVAL)?;
            out.put_i32(tokens.get_or_create_id(TokenKind::Label, label)?)?;
        }
        for label in added {
            out.put_u8(LABEL_ADDITION)?;
            out.put_i32(tokens.get_or_create_id(TokenKind::Label, label)?)?;
        }
    }
    out.put_u8(END_OF_LABEL_CHANGES)?;
    state.labels = wanted.into_iter().map(str::to_owned).collect();
    Ok(())
}

fn write_relationship<W: WritableChannel>(
    rel: &RelationshipRecord,
    state: &mut DiffState,
    tokens: &TokenDictionary<W>,
    types: &ValueTypes,
    out: &mut dyn WritableChannel,
) -> Result<()> {
    write_properties(&rel.properties, tokens, types, out)?;
    match rel.id {
        Some(id) => {
            out.put_u8(HAS_RELATIONSHIP_ID)?;
            out.put_i64(id)?;
        }
        None => out.put_u8(NO_RELATIONSHIP_ID)?,
    }
    write_group(0, &rel.start_group, state, tokens, out)?;
    types.write_optional(Some(&rel.start_id), out)?;
    write_group(1, &rel.end_group, state, tokens, out)?;
    types.write_optional(Some(&rel.end_id), out)?;
    match &rel.rel_type {
        RelType::Id(id) => {
            out.put_u8(HAS_TYPE_ID)?;
            out.put_i32(*id)
        }
        RelType::Missing => out.put_u8(NO_TYPE),
        RelType::Name(name) if state.rel_type.as_deref() == Some(name.as_str()) => {
            out.put_u8(SAME_TYPE)
        }
        RelType::Name(name) => {
            out.put_u8(NEW_TYPE)?;
            out.put_i32(tokens.get_or_create_id(TokenKind::RelationshipType, name)?)?;
            state.rel_type = Some(name.clone());
            Ok(())
        }
    }
}

/// Decodes the next entity of a chunk onto `visitor`.
///
/// Returns `false` on [`END_OF_ENTITIES`] without calling the visitor.
pub fn read_entity(
    kind: EntityKind,
    inp: &mut dyn ReadableChannel,
    state: &mut DiffState,
    tokens: &TokenTable,
    types: &ValueTypes,
    visitor: &mut dyn InputEntityVisitor,
) -> Result<bool> {
    let count = inp.get_i16()?;
    match count {
        END_OF_ENTITIES => return Ok(false),
        HAS_FIRST_PROPERTY_ID => visitor.property_id(inp.get_i64()?),
        n if n >= 0 => {
            for _ in 0..n {
                let key = tokens.name(TokenKind::PropertyKey, inp.get_i32()?)?;
                let value = types.read(inp)?;
                visitor.property(key, value);
            }
        }
        other => {
            return Err(StageError::corruption(format!(
                "invalid property count {other}"
            )))
        }
    }
    match kind {
        EntityKind::Node => read_node(inp, state, tokens, types, visitor)?,
        EntityKind::Relationship => read_relationship(inp, state, tokens, types, visitor)?,
    }
    visitor.end_of_entity()?;
    Ok(true)
}

fn read_group(
    slot: usize,
    inp: &mut dyn ReadableChannel,
    state: &mut DiffState,
    tokens: &TokenTable,
) -> Result<Group> {
    match inp.get_u8()? {
        SAME_GROUP => Ok(state.groups[slot].clone()),
        NEW_GROUP => {
            let id = inp.get_i32()?;
            let group = match inp.get_i32()? {
                NO_GROUP_NAME => Group::new(id, None),
                token => Group::new(id, Some(tokens.name(TokenKind::Group, token)?)),
            };
            state.groups[slot] = group.clone();
            Ok(group)
        }
        other => Err(StageError::corruption(format!("invalid group marker {other}"))),
    }
}

fn read_id(inp: &mut dyn ReadableChannel, types: &ValueTypes) -> Result<Value> {
    Ok(types.read_optional(inp)?.unwrap_or(Value::Null))
}

fn read_node(
    inp: &mut dyn ReadableChannel,
    state: &mut DiffState,
    tokens: &TokenTable,
    types: &ValueTypes,
    visitor: &mut dyn InputEntityVisitor,
) -> Result<()> {
    let group = read_group(0, inp, state, tokens)?;
    let id = read_id(inp, types)?;
    visitor.id(id, &group);
    let mut marker = inp.get_u8()?;
    if marker == HAS_LABEL_FIELD {
        visitor.label_field(inp.get_i64()?);
        return Ok(());
    }
    loop {
        match marker {
            END_OF_LABEL_CHANGES => break,
            LABEL_REMOVAL => {
                let label = tokens.name(TokenKind::Label, inp.get_i32()?)?;
                state.labels.retain(|l| l != label);
            }
            LABEL_ADDITION => {
                let label = tokens.name(TokenKind::Label, inp.get_i32()?)?;
                state.labels.push(label.to_owned());
            }
            other => {
                return Err(StageError::corruption(format!(
                    "invalid label change marker {other}"
                )))
            }
        }
        marker = inp.get_u8()?;
    }
    visitor.labels(&state.labels);
    Ok(())
}

fn read_relationship(
    inp: &mut dyn ReadableChannel,
    state: &mut DiffState,
    tokens: &TokenTable,
    types: &ValueTypes,
    visitor: &mut dyn InputEntityVisitor,
) -> Result<()> {
    match inp.get_u8()? {
        NO_RELATIONSHIP_ID => {}
        HAS_RELATIONSHIP_ID => visitor.relationship_id(inp.get_i64()?),
        other => {
            return Err(StageError::corruption(format!(
                "invalid relationship id marker {other}"
            )))
        }
    }
    let start_group = read_group(0, inp, state, tokens)?;
    let start = read_id(inp, types)?;
    visitor.start_id(start, &start_group);
    let end_group = read_group(1, inp, state, tokens)?;
    let end = read_id(inp, types)?;
    visitor.end_id(end, &end_group);
    match inp.get_u8()? {
        SAME_TYPE => match &state.rel_type {
            Some(name) => visitor.rel_type(name),
            None => return Err(StageError::corruption("same-type marker without a previous type")),
        },
        NEW_TYPE => {
            let name = tokens.name(TokenKind::RelationshipType, inp.get_i32()?)?;
            visitor.rel_type(name);
            state.rel_type = Some(name.to_owned());
        }
        HAS_TYPE_ID => visitor.type_id(inp.get_i32()?),
        NO_TYPE => {}
        other => {
            return Err(StageError::corruption(format!("invalid type marker {other}")))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::source::RecordCollector;
    use crate::input::tokens::TokenLimits;
    use crate::primitives::bytes::{ByteBuffer, ChunkCursor};

    fn node(labels: &[&str]) -> EntityRecord {
        EntityRecord::Node(NodeRecord {
            properties: Properties::Inline(vec![("name".into(), Value::from("n"))]),
            id: Value::Long(1),
            group: Group::global(),
            labels: Labels::Names(labels.iter().map(|l| l.to_string()).collect()),
        })
    }

    fn rel(rel_type: RelType, start_group: Group) -> EntityRecord {
        EntityRecord::Relationship(RelationshipRecord {
            properties: Properties::default(),
            id: None,
            start_id: Value::Long(1),
            start_group,
            end_id: Value::from("b"),
            end_group: Group::global(),
            rel_type,
        })
    }

    /// Writes `records` as one chunk and reads them back.
    fn roundtrip(kind: EntityKind, records: &[EntityRecord]) -> Vec<EntityRecord> {
        let types = ValueTypes::new();
        let dict = TokenDictionary::new(ByteBuffer::with_capacity(64), TokenLimits::default());
        let mut buf = ByteBuffer::with_capacity(256);
        let mut state = DiffState::new();
        for record in records {
            write_entity(record, &mut state, &dict, &types, &mut buf).unwrap();
        }
        buf.put_i16(END_OF_ENTITIES).unwrap();
        dict.finish().unwrap();
        let mut header = ChunkCursor::new(dict.into_header().take());
        let table = TokenTable::read(&mut header).unwrap();

        let mut cursor = ChunkCursor::new(buf.take());
        let mut state = DiffState::new();
        let mut out = RecordCollector::new(kind);
        while read_entity(kind, &mut cursor, &mut state, &table, &types, &mut out).unwrap() {}
        assert_eq!(cursor.remaining(), 0);
        out.into_records()
    }

    #[test]
    fn label_diff_reproduces_sequence() {
        let records = vec![
            node(&["A", "B"]),
            node(&["A", "B"]),
            node(&["A"]),
            node(&["A", "C"]),
        ];
        assert_eq!(roundtrip(EntityKind::Node, &records), records);
    }

    #[test]
    fn reordered_labels_survive() {
        let records = vec![node(&["A", "B"]), node(&["B", "A"]), node(&[])];
        assert_eq!(roundtrip(EntityKind::Node, &records), records);
    }

    #[test]
    fn label_field_bypasses_diff() {
        let mut with_field = node(&[]);
        if let EntityRecord::Node(n) = &mut with_field {
            n.labels = Labels::Field(0x55);
            n.properties = Properties::FirstPropertyId(9);
        }
        let records = vec![node(&["A"]), with_field, node(&["A"])];
        assert_eq!(roundtrip(EntityKind::Node, &records), records);
    }

    #[test]
    fn null_properties_are_skipped() {
        let record = EntityRecord::Node(NodeRecord {
            properties: Properties::Inline(vec![
                ("a".into(), Value::Null),
                ("b".into(), Value::Int(2)),
            ]),
            id: Value::Null,
            group: Group::global(),
            labels: Labels::Names(vec![]),
        });
        let back = roundtrip(EntityKind::Node, &[record]);
        let EntityRecord::Node(n) = &back[0] else {
            panic!("expected node");
        };
        assert_eq!(n.properties, Properties::Inline(vec![("b".into(), Value::Int(2))]));
        assert!(n.id.is_null());
    }

    #[test]
    fn relationship_types_and_groups_roundtrip() {
        let people = Group::new(1, Some("people"));
        let records = vec![
            rel(RelType::Name("KNOWS".into()), people.clone()),
            rel(RelType::Name("KNOWS".into()), people.clone()),
            rel(RelType::Id(4), Group::global()),
            rel(RelType::Name("LIKES".into()), people),
            rel(RelType::Missing, Group::global()),
        ];
        assert_eq!(roundtrip(EntityKind::Relationship, &records), records);
    }

    #[test]
    fn same_type_without_previous_is_corruption() {
        let types = ValueTypes::new();
        let mut buf = ByteBuffer::with_capacity(32);
        buf.put_i16(0).unwrap();
        buf.put_u8(NO_RELATIONSHIP_ID).unwrap();
        buf.put_u8(SAME_GROUP).unwrap();
        buf.put_u8(0).unwrap();
        buf.put_u8(SAME_GROUP).unwrap();
        buf.put_u8(0).unwrap();
        buf.put_u8(SAME_TYPE).unwrap();
        let mut cursor = ChunkCursor::new(buf.take());
        let mut out = RecordCollector::new(EntityKind::Relationship);
        let err = read_entity(
            EntityKind::Relationship,
            &mut cursor,
            &mut DiffState::new(),
            &TokenTable::default(),
            &types,
            &mut out,
        )
        .unwrap_err();
        assert!(matches!(err, StageError::Corruption(_)));
    }

    #[test]
    fn unknown_token_is_corruption() {
        let types = ValueTypes::new();
        let mut buf = ByteBuffer::with_capacity(32);
        buf.put_i16(1).unwrap();
        buf.put_i32(17).unwrap();
        let mut cursor = ChunkCursor::new(buf.take());
        let mut out = RecordCollector::new(EntityKind::Node);
        let err = read_entity(
            EntityKind::Node,
            &mut cursor,
            &mut DiffState::new(),
            &TokenTable::default(),
            &types,
            &mut out,
        )
        .unwrap_err();
        assert!(matches!(err, StageError::Corruption(_)));
    }
}
