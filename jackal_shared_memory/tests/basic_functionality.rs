//! Basic functionality tests for jackal shared memory

use jackal_shared_memory::{
    AUDIO, BufferAddress, EVENT, PortPool, ShmConfig, ShmContext, ShmError, ShmResult, as_f32,
    as_f32_mut,
};
use proptest::prelude::*;
use std::path::Path;

fn context(dir: &Path, prefix: &str) -> ShmResult<ShmContext> {
    ShmContext::init(&ShmConfig {
        directory: dir.to_path_buf(),
        prefix: prefix.to_string(),
        lock_segments: false,
    })
}

#[test]
fn test_port_data_visible_through_second_attachment() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let mut ctx = context(dir.path(), "vis")?;
    let mut pool = PortPool::create(&mut ctx, AUDIO, 128, 4)?;
    let port = pool.alloc()?;

    // SAFETY: this test is the only party touching the region.
    let samples = as_f32_mut(unsafe { pool.attachment().slice_mut(&port.address) });
    for (i, s) in samples.iter_mut().enumerate() {
        *s = i as f32 * 0.25;
    }

    // Independent mapping, as a client process would have.
    let remote = ctx.attach_fresh(port.address.segment)?;
    remote.validate(&port.address)?;
    let seen = as_f32(unsafe { remote.slice(&port.address) });
    assert_eq!(seen.len(), 128);
    assert_eq!(seen[0], 0.0);
    assert_eq!(seen[127], 127.0 * 0.25);
    Ok(())
}

#[test]
fn test_registry_survives_context_and_cleans_on_teardown() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let mut ctx = context(dir.path(), "persist")?;
    let seg = ctx.shmalloc(2048)?;
    let index = seg.index();
    drop(seg);

    // A second context in the same process sees the entry; our pid is alive.
    let mut other = context(dir.path(), "persist")?;
    let attached = other.attach(index)?;
    assert_eq!(attached.size(), 2048);
    drop(attached);
    other.release(index)?;

    ctx.teardown()?;
    let after = context(dir.path(), "persist")?;
    assert!(after.registry().is_empty());
    Ok(())
}

#[test]
fn test_out_of_bounds_rejected() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let mut ctx = context(dir.path(), "bounds")?;
    let seg = ctx.shmalloc(1024)?;

    let past_end = BufferAddress {
        segment: seg.index(),
        offset: 1000,
        len: 100,
    };
    assert!(matches!(
        seg.validate(&past_end),
        Err(ShmError::OutOfBounds { .. })
    ));

    let wrong_segment = BufferAddress {
        segment: seg.index() + 1,
        offset: 0,
        len: 1,
    };
    assert!(matches!(
        seg.write_from(&wrong_segment, &[1]),
        Err(ShmError::UnknownSegment { .. })
    ));
    Ok(())
}

#[test]
fn test_event_ports_use_fixed_size() -> ShmResult<()> {
    let dir = tempfile::tempdir()?;
    let mut ctx = context(dir.path(), "event")?;
    let mut pool = PortPool::create(&mut ctx, EVENT, 64, 2)?;
    let port = pool.alloc()?;
    assert_eq!(port.address.len, EVENT.fixed_size);
    assert_eq!(port.scale_factor, -1);
    pool.validate(&port)?;
    Ok(())
}

proptest! {
    #[test]
    fn prop_validated_addresses_stay_inside_segment(offset in 0usize..8192, len in 0usize..8192) {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), "prop").unwrap();
        let seg = ctx.shmalloc(4096).unwrap();
        let addr = BufferAddress { segment: seg.index(), offset, len };
        prop_assert_eq!(seg.validate(&addr).is_ok(), offset + len <= 4096);
    }
}
