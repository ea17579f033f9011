use super::*;

fn handle(index: u32) -> ObjectHandle {
    ObjectHandle::new(index, 0)
}

#[test]
fn get_or_create_is_idempotent_per_handle() {
    let mut registry = IdentityRegistry::new(IdAllocator::sequential());
    let first = registry.get_or_create_id(handle(0));
    let again = registry.get_or_create_id(handle(0));
    let other = registry.get_or_create_id(handle(1));

    assert_eq!(first, again);
    assert_ne!(first, other);
    assert_eq!(registry.resolve(first), Some(handle(0)));
    assert_eq!(registry.id_of(handle(1)), Some(other));
    assert_eq!(registry.len(), 2);
}

#[test]
fn ephemeral_ids_are_process_local_and_stable() {
    let mut registry = IdentityRegistry::default();
    let a = registry.assign_ephemeral(handle(3));
    let b = registry.assign_ephemeral(handle(4));
    assert!(a.is_ephemeral());
    assert_ne!(a, b);
    assert_eq!(registry.assign_ephemeral(handle(3)), a);
    assert_eq!(registry.get_or_create_id(handle(3)), a);
}

#[test]
fn bind_refuses_collisions_and_rebinds() {
    let mut registry = IdentityRegistry::default();
    let id = ObjectId::from_u128(99);
    registry.bind(id, handle(0)).expect("first bind should succeed");
    registry.bind(id, handle(0)).expect("same pair should be a no-op");

    let err = registry
        .bind(id, handle(1))
        .expect_err("second object for one id should be refused");
    assert!(matches!(err, GraphError::IdentityCollision { .. }));
    assert!(err.is_fatal());

    let err = registry
        .bind(ObjectId::from_u128(100), handle(0))
        .expect_err("second id for one object should be refused");
    assert!(matches!(err, GraphError::IdentityRebind { .. }));
    assert_eq!(registry.len(), 1);
}

#[test]
fn unbind_removes_both_directions() {
    let mut registry = IdentityRegistry::new(IdAllocator::sequential());
    let a = registry.get_or_create_id(handle(0));
    let b = registry.get_or_create_id(handle(1));

    assert_eq!(registry.unbind(handle(0)), Some(a));
    assert_eq!(registry.resolve(a), None);
    assert_eq!(registry.unbind_id(b), Some(handle(1)));
    assert_eq!(registry.id_of(handle(1)), None);
    assert!(registry.is_empty());

    registry
        .bind(a, handle(1))
        .expect("freed pair should be bindable again");
}

#[test]
fn allocate_skips_ids_already_bound() {
    let mut registry = IdentityRegistry::new(IdAllocator::sequential());
    registry
        .bind(ObjectId::from_u128(1), handle(7))
        .expect("bind should succeed");
    assert_eq!(registry.allocate(), ObjectId::from_u128(2));
    assert_eq!(
        registry.entries(),
        vec![(ObjectId::from_u128(1), handle(7))]
    );
}
