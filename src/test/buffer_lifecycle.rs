use crate::cc::gather::{
    BufferRole, GatherGeometry, PublicHandle, PublicMemory, PublicMemoryRegistry, TreeShape,
    acquire, release,
};
use crate::error::GatherError;

fn geometry(nproc: usize, root: usize) -> GatherGeometry {
    GatherGeometry {
        nproc,
        root,
        nelems: 3,
        elem_size: 4,
    }
}

#[test]
fn role_follows_root() {
    let geo = geometry(6, 4);
    assert_eq!(BufferRole::of(4, &geo), BufferRole::Root);
    assert_eq!(BufferRole::of(0, &geo), BufferRole::Participant);
}

#[test]
fn root_registers_full_result_and_participants_the_top_half() {
    let geo = geometry(6, 4);
    let shape = TreeShape::plan(6);
    assert_eq!(BufferRole::Root.buffer_bytes(&geo, &shape), 6 * 3 * 4);
    assert_eq!(geo.result_bytes() as u64, 6 * 3 * 4);
    assert_eq!(BufferRole::Participant.buffer_bytes(&geo, &shape), 4 * 3 * 4);
}

#[test]
fn root_buffer_is_made_public_and_returned_on_release() {
    let geo = geometry(4, 0);
    let shape = TreeShape::plan(4);
    let mut mem = PublicMemoryRegistry::default();
    let local: Vec<u8> = (0..12).collect();

    let buf = acquire(&mut mem, BufferRole::Root, &geo, &shape, Some(local.as_slice()))
        .expect("acquire")
        .expect("buffer");
    assert_eq!(buf.size, 48);
    assert_eq!(mem.counters.made, 1);
    assert_eq!(mem.counters.allocated, 0);
    assert_eq!(mem.registered_bytes(), 48);
    let bytes = mem.bytes(buf.handle).expect("registered");
    assert_eq!(&bytes[..12], local.as_slice());
    assert!(bytes[12..].iter().all(|b| *b == 0));

    let result = release(&mut mem, Some(buf), &geo, &shape)
        .expect("release")
        .expect("root gets its memory back");
    assert_eq!(result.len(), 48);
    assert_eq!(&result[..12], local.as_slice());
    assert_eq!(mem.counters.unmade, 1);
    assert_eq!(mem.counters.freed, 0);
    assert_eq!(mem.registered_bytes(), 0);
    assert_eq!(mem.live_regions(), 0);
}

#[test]
fn participant_buffer_is_allocated_and_freed() {
    let geo = geometry(5, 0);
    let shape = TreeShape::plan(5);
    let mut mem = PublicMemoryRegistry::default();
    let local = vec![7u8; 12];

    let buf = acquire(&mut mem, BufferRole::Participant, &geo, &shape, Some(local.as_slice()))
        .expect("acquire")
        .expect("buffer");
    assert_eq!(buf.size, 4 * 12);
    assert_eq!(mem.counters.allocated, 1);
    assert_eq!(&mem.bytes(buf.handle).expect("registered")[..12], local.as_slice());

    assert_eq!(release(&mut mem, Some(buf), &geo, &shape).expect("release"), None);
    assert_eq!(mem.counters.freed, 1);
    assert_eq!(mem.counters.unmade, 0);
    assert_eq!(mem.live_regions(), 0);
}

#[test]
fn release_size_matches_acquire_for_every_role_and_shape() {
    for nproc in 2..=20 {
        for root in [0, nproc - 1] {
            let geo = geometry(nproc, root);
            let shape = TreeShape::plan(nproc);
            for rank in 0..nproc {
                let role = BufferRole::of(rank, &geo);
                let mut mem = PublicMemoryRegistry::default();
                let local = vec![1u8; geo.contribution_bytes()];
                let buf = acquire(&mut mem, role, &geo, &shape, Some(local.as_slice()))
                    .expect("acquire")
                    .expect("buffer");
                assert_eq!(buf.size, role.buffer_bytes(&geo, &shape));
                release(&mut mem, Some(buf), &geo, &shape).expect("release with same size");
                assert_eq!(mem.registered_bytes(), 0);
            }
        }
    }
}

#[test]
fn rank_without_data_registers_nothing() {
    let geo = geometry(4, 0);
    let shape = TreeShape::plan(4);
    let mut mem = PublicMemoryRegistry::default();
    for role in [BufferRole::Root, BufferRole::Participant] {
        let buf = acquire(&mut mem, role, &geo, &shape, None).expect("acquire");
        assert!(buf.is_none());
        assert_eq!(release(&mut mem, buf, &geo, &shape).expect("release"), None);
    }
    assert_eq!(mem.counters, Default::default());
}

#[test]
fn wrong_contribution_size_is_a_config_error() {
    let geo = geometry(4, 0);
    let shape = TreeShape::plan(4);
    let mut mem = PublicMemoryRegistry::default();
    let err = acquire(&mut mem, BufferRole::Root, &geo, &shape, Some(&[0u8; 5][..])).unwrap_err();
    assert!(matches!(err, GatherError::InvalidConfig(_)));
    assert_eq!(mem.live_regions(), 0);
}

#[test]
fn exhausted_public_memory_is_a_resource_error() {
    let geo = geometry(4, 0);
    let shape = TreeShape::plan(4);
    let mut mem = PublicMemoryRegistry::with_capacity_bytes(40);
    let local = vec![0u8; 12];
    let err = acquire(&mut mem, BufferRole::Root, &geo, &shape, Some(local.as_slice())).unwrap_err();
    assert_eq!(
        err,
        GatherError::OutOfPublicMemory {
            requested: 48,
            available: 40
        }
    );
    assert!(!err.is_internal());
    assert_eq!(mem.registered_bytes(), 0);

    let buf = acquire(&mut mem, BufferRole::Participant, &geo, &shape, Some(local.as_slice()))
        .expect("24 bytes fit")
        .expect("buffer");
    assert_eq!(mem.registered_bytes(), 24);
    release(&mut mem, Some(buf), &geo, &shape).expect("release");
}

#[test]
fn registry_rejects_mixed_or_resized_release() {
    let mut mem = PublicMemoryRegistry::default();
    let made = mem.make_public_buffer(vec![0; 16]).expect("make");
    let allocated = mem.allocate_public_buffer(8).expect("allocate");

    assert!(matches!(
        mem.free_public_buffer(made, 16),
        Err(GatherError::Internal(_))
    ));
    assert!(matches!(
        mem.unmake_public_buffer(allocated, 8),
        Err(GatherError::Internal(_))
    ));
    assert_eq!(
        mem.free_public_buffer(allocated, 4).unwrap_err(),
        GatherError::SizeMismatch {
            handle: allocated,
            expected: 8,
            actual: 4
        }
    );
    assert_eq!(
        mem.free_public_buffer(PublicHandle(99), 8).unwrap_err(),
        GatherError::UnknownBuffer(PublicHandle(99))
    );

    assert_eq!(mem.unmake_public_buffer(made, 16).expect("unmake").len(), 16);
    mem.free_public_buffer(allocated, 8).expect("free");
    assert_eq!(mem.live_regions(), 0);
}
