use super::*;

#[test]
fn display_and_parse_roundtrip_both_kinds() {
    let persistent = ObjectId::from_u128(0x1234);
    let text = persistent.to_string();
    assert_eq!(text, "00000000-0000-0000-0000-000000001234");
    assert_eq!(text.parse::<ObjectId>(), Ok(persistent));

    let ephemeral = ObjectId::Ephemeral(42);
    assert_eq!(ephemeral.to_string(), "~42");
    assert_eq!("~42".parse::<ObjectId>(), Ok(ephemeral));
}

#[test]
fn parse_rejects_garbage() {
    assert!("not-an-id".parse::<ObjectId>().is_err());
    assert!("~".parse::<ObjectId>().is_err());
    assert!("~-3".parse::<ObjectId>().is_err());
}

#[test]
fn persistent_ids_sort_before_ephemeral_ids() {
    let mut ids = vec![
        ObjectId::Ephemeral(1),
        ObjectId::from_u128(u128::MAX),
        ObjectId::from_u128(3),
    ];
    ids.sort();
    assert_eq!(
        ids,
        vec![
            ObjectId::from_u128(3),
            ObjectId::from_u128(u128::MAX),
            ObjectId::Ephemeral(1),
        ]
    );
}

#[test]
fn import_key_ids_are_stable_and_distinct() {
    let a = ObjectId::from_import_key("material:stone");
    let b = ObjectId::from_import_key("material:stone");
    let c = ObjectId::from_import_key("material:wood");
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert!(a.is_persistent());
}

#[test]
fn json_uses_string_form() {
    let id = ObjectId::from_u128(7);
    let json = serde_json::to_string(&id).expect("id should serialize");
    assert_eq!(json, "\"00000000-0000-0000-0000-000000000007\"");
    let back: ObjectId = serde_json::from_str(&json).expect("id should deserialize");
    assert_eq!(back, id);
}

#[test]
fn postcard_uses_compact_form() {
    let ids = vec![ObjectId::from_u128(9), ObjectId::Ephemeral(5)];
    let bytes = postcard::to_allocvec(&ids).expect("ids should serialize");
    let back: Vec<ObjectId> = postcard::from_bytes(&bytes).expect("ids should deserialize");
    assert_eq!(back, ids);
}

#[test]
fn sequential_allocator_is_deterministic() {
    let mut first = IdAllocator::sequential();
    let mut second = IdAllocator::sequential();
    let a: Vec<ObjectId> = (0..3).map(|_| first.next_persistent()).collect();
    let b: Vec<ObjectId> = (0..3).map(|_| second.next_persistent()).collect();
    assert_eq!(a, b);
    assert_eq!(a[0], ObjectId::from_u128(1));
    assert_eq!(a[2], ObjectId::from_u128(3));
}

#[test]
fn random_allocator_yields_persistent_ids() {
    let mut allocator = IdAllocator::Random;
    let a = allocator.next_persistent();
    let b = allocator.next_persistent();
    assert_ne!(a, b);
    assert_eq!(a.kind(), IdKind::Persistent);
}

#[test]
fn skip_past_moves_sequential_allocator_beyond_used_ids() {
    let mut allocator = IdAllocator::sequential();
    allocator.skip_past([
        ObjectId::from_u128(7),
        ObjectId::Ephemeral(100),
        ObjectId::from_u128(3),
    ]);
    assert_eq!(allocator.next_persistent(), ObjectId::from_u128(8));

    let mut random = IdAllocator::Random;
    random.skip_past([ObjectId::from_u128(7)]);
    assert!(matches!(random, IdAllocator::Random));
}
