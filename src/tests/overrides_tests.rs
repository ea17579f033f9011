use super::*;
use crate::codec::Value;

fn key(part: u128, field: u16) -> OverrideKey {
    OverrideKey::new(ObjectId::from_u128(part), FieldIndex::new(field))
}

#[test]
fn diff_reports_only_changed_fields() {
    let part = ObjectId::from_u128(1);
    let base = Record::new("demo", 1)
        .with(0, Value::from("same"))
        .with(1, Value::from(1))
        .with(2, FieldData::Ref(None));
    let live = Record::new("demo", 1)
        .with(0, Value::from("same"))
        .with(1, Value::from(2))
        .with(2, FieldData::Ref(Some(ObjectId::from_u128(5))));

    let diff = diff_record(part, &live, &base);
    let fields: Vec<u16> = diff.iter().map(|record| record.field.raw()).collect();
    assert_eq!(fields, vec![1, 2]);
    assert_eq!(diff[0].value, FieldData::Value(Value::Int(2)));
    assert!(diff_record(part, &base, &base).is_empty());
}

#[test]
fn diff_of_nan_against_itself_is_clean() {
    let record = Record::new("demo", 1).with(0, Value::Float(f64::NAN));
    assert!(diff_record(ObjectId::from_u128(1), &record, &record).is_empty());
}

#[test]
fn type_change_overrides_every_field() {
    let part = ObjectId::from_u128(1);
    let base = Record::new("old", 1).with(0, Value::from("x"));
    let live = Record::new("new", 1)
        .with(0, Value::from("x"))
        .with(1, Value::from(true));
    assert_eq!(diff_record(part, &live, &base).len(), 2);
}

#[test]
fn set_keeps_one_entry_per_key_and_layers_nearer_values() {
    let mut base = OverrideSet::new();
    base.insert(key(1, 0), Value::from("base").into());
    base.insert(key(1, 1), Value::from(1).into());
    assert_eq!(
        base.insert(key(1, 1), Value::from(2).into()),
        Some(FieldData::Value(Value::Int(1)))
    );
    assert_eq!(base.len(), 2);

    let mut nearer = OverrideSet::new();
    nearer.insert(key(1, 0), Value::from("near").into());
    nearer.insert(key(2, 0), Value::from("other").into());
    base.layer(&nearer);

    assert_eq!(base.len(), 3);
    assert_eq!(
        base.get(&key(1, 0)),
        Some(&FieldData::Value(Value::from("near")))
    );
    assert_eq!(base.keys_for(ObjectId::from_u128(1)), vec![key(1, 0), key(1, 1)]);
    assert_eq!(base.parts().len(), 2);
}

#[test]
fn set_serializes_as_record_list() {
    let mut set = OverrideSet::new();
    set.insert(key(2, 3), FieldData::Refs(vec![ObjectId::from_u128(9)]));
    set.insert(key(1, 0), Value::from("a").into());

    let json = serde_json::to_value(&set).expect("set should serialize");
    let list = json.as_array().expect("set should be a list");
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["field"], 0);

    let back: OverrideSet = serde_json::from_value(json).expect("set should deserialize");
    assert_eq!(back, set);
}

#[test]
fn tracker_scopes_dirty_objects_per_instance() {
    let mut tracker = OverrideTracker::new();
    let (a, b, c) = (
        ObjectHandle::new(0, 0),
        ObjectHandle::new(1, 0),
        ObjectHandle::new(2, 0),
    );
    let first = InstanceId::new(1);
    let second = InstanceId::new(2);
    tracker.track(a, first);
    tracker.track(b, first);
    tracker.track(c, second);

    assert!(tracker.mark_dirty(b));
    assert!(!tracker.mark_dirty(b));
    assert!(tracker.mark_dirty(c));
    assert!(tracker.mark_dirty(a));
    assert_eq!(tracker.dirty_for(first), vec![a, b]);
    assert_eq!(tracker.dirty_instances().len(), 2);

    tracker.clear(&[a, b]);
    assert!(tracker.dirty_for(first).is_empty());
    tracker.untrack(c);
    assert_eq!(tracker.owner(c), None);
    assert!(!tracker.is_dirty(c));
    assert_eq!(tracker.dirty_len(), 0);
}
