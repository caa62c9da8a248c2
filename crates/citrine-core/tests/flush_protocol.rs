//! Command buffer fill/flush protocol: state emission at the head of a
//! fresh buffer, overflow- and hint-driven flushes, and lost-context
//! handling when the hardware lock changes hands.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use citrine_core::drm::cmd::packet_header;
use citrine_core::drm::{ClipRect, DrmDevice, Sarea, SoftDevice};
use citrine_core::{CitrineContext, Cn100, DriverOptions, StaticWindowSystem};

/// Dwords of one full CN100 state emission (header plus payload for every
/// atom that emits on this chip).
const CN100_STATE_DWORDS: u32 = 74;

fn fixture(options: DriverOptions) -> (CitrineContext, SoftDevice, StaticWindowSystem) {
    let sarea = Arc::new(Sarea::new());
    let device = SoftDevice::new(Arc::clone(&sarea));
    let winsys = StaticWindowSystem::new(vec![ClipRect::new(0, 0, 640, 480)]);
    let ctx = CitrineContext::new(
        1,
        options,
        Box::new(device.clone()),
        sarea,
        Box::new(winsys.clone()),
        Box::new(Cn100),
    );
    (ctx, device, winsys)
}

fn emit_draw(ctx: &mut CitrineContext, payload: u16) {
    let mut batch = ctx.begin_batch(u32::from(payload) + 1, true).unwrap();
    batch.emit(packet_header(payload));
    for _ in 0..payload {
        batch.emit(0);
    }
}

#[test]
fn fresh_buffer_leads_with_dirty_state() {
    let (mut ctx, dev, _ws) = fixture(DriverOptions::default());
    assert!(ctx.context_lost());

    emit_draw(&mut ctx, 2);
    assert_eq!(ctx.cmdbuf().used(), CN100_STATE_DWORDS + 3);
    assert!(!ctx.context_lost());
    assert!(!ctx.atoms().any_dirty());

    ctx.flush().unwrap();
    assert!(ctx.cmdbuf().is_empty());
    // Nine state packets plus the draw packet.
    assert_eq!(dev.counters().submissions, 1);
    assert_eq!(dev.counters().packets, 10);
    assert_eq!(dev.last_stream().len(), (CN100_STATE_DWORDS + 3) as usize);
    // The flush pessimistically re-dirties everything.
    assert!(ctx.atoms().any_dirty());
    assert!(ctx.context_lost());
}

#[test]
fn flush_of_an_empty_buffer_is_a_no_op() {
    let (mut ctx, dev, _ws) = fixture(DriverOptions::default());
    ctx.flush().unwrap();
    ctx.fire_vertices().unwrap();
    assert_eq!(dev.counters().submissions, 0);
    // The explicit flush still took and released the lock once.
    assert_eq!(dev.counters().unlocks, 1);
}

#[test]
fn overflow_flushes_before_the_request() {
    let options = DriverOptions {
        cmdbuf_dwords_hint: 16,
        ..DriverOptions::default()
    };
    let (mut ctx, dev, _ws) = fixture(options);
    assert_eq!(ctx.cmdbuf().capacity(), 256);

    // Two 100-dword packets fit; the third would cross the safety margin.
    for _ in 0..2 {
        let mut batch = ctx.begin_batch(100, false).unwrap();
        batch.emit(packet_header(99));
        batch.emit_slice(&[0; 99]);
    }
    assert_eq!(dev.counters().submissions, 0);
    assert_eq!(ctx.cmdbuf().used(), 200);

    let mut batch = ctx.begin_batch(100, false).unwrap();
    batch.emit(packet_header(99));
    batch.emit_slice(&[0; 99]);
    drop(batch);
    assert_eq!(dev.counters().submissions, 1);
    assert_eq!(dev.last_stream().len(), 200);
    assert_eq!(ctx.cmdbuf().used(), 100);
}

#[test]
fn kernel_hint_forces_a_flush() {
    let (mut ctx, dev, _ws) = fixture(DriverOptions::default());
    emit_draw(&mut ctx, 2);

    dev.set_stream_needs_flush(true);
    // Plenty of room, but the kernel wants the stream now.
    assert!(ctx.ensure_space(8).unwrap());
    assert_eq!(dev.counters().submissions, 1);

    // Submission cleared the hint.
    assert!(!ctx.ensure_space(8).unwrap());
    assert_eq!(dev.counters().submissions, 1);
}

#[test]
fn lock_change_of_hands_loses_the_context() {
    let (mut ctx, mut dev, _ws) = fixture(DriverOptions::default());
    emit_draw(&mut ctx, 2);
    ctx.flush().unwrap();
    emit_draw(&mut ctx, 2);
    assert!(!ctx.atoms().any_dirty());

    // Another context takes and releases the lock behind our back.
    dev.lock_wait(2).unwrap();
    dev.unlock(2).unwrap();

    ctx.flush().unwrap();
    assert!(ctx.context_lost());
    assert!(ctx.atoms().any_dirty());
    assert_eq!(dev.counters().lock_waits, 2);
    assert_eq!(dev.counters().submissions, 2);

    // The next draw leads with a full state emission again.
    emit_draw(&mut ctx, 2);
    assert_eq!(ctx.cmdbuf().used(), CN100_STATE_DWORDS + 3);
}

#[test]
fn drawable_stamp_refreshes_cliprects() {
    let (mut ctx, dev, ws) = fixture(DriverOptions::default());
    assert_eq!(ctx.cliprects().len(), 1);

    ws.set_cliprects(vec![
        ClipRect::new(0, 0, 320, 480),
        ClipRect::new(320, 0, 640, 480),
    ]);
    // Nothing is picked up until the stamp moves.
    ctx.flush().unwrap();
    assert_eq!(ctx.cliprects().len(), 1);

    dev.sarea().bump_drawable_stamp();
    ctx.flush().unwrap();
    assert_eq!(ctx.cliprects().len(), 2);
}

#[test]
#[should_panic(expected = "exceeds the command buffer")]
fn oversized_request_asserts() {
    let (mut ctx, _dev, _ws) = fixture(DriverOptions::default());
    let capacity = ctx.cmdbuf().capacity();
    let _ = ctx.ensure_space(capacity);
}
