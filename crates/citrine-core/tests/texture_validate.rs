//! Texture residency through the context: gathering a mipmap chain into
//! one miptree, whole-chain fallback, and the flush rule when storage the
//! stream still references is replaced.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use citrine_core::drm::cmd::packet_header;
use citrine_core::drm::{ClipRect, Sarea, SoftDevice};
use citrine_core::{
    BoManager, CitrineContext, Cn100, DriverOptions, StaticWindowSystem, TexImage, TexObj,
};

fn fixture() -> (CitrineContext, SoftDevice) {
    let sarea = Arc::new(Sarea::new());
    let device = SoftDevice::new(Arc::clone(&sarea));
    let winsys = StaticWindowSystem::new(vec![ClipRect::new(0, 0, 640, 480)]);
    let ctx = CitrineContext::new(
        1,
        DriverOptions::default(),
        Box::new(device.clone()),
        sarea,
        Box::new(winsys),
        Box::new(Cn100),
    );
    (ctx, device)
}

fn system_image(width: u32, height: u32, fill: u8) -> TexImage {
    let cpp = 2;
    let rowstride = width * cpp;
    let data = vec![fill; (rowstride * height) as usize];
    TexImage::new_system(width, height, 1, cpp, rowstride, data)
}

#[test]
fn validate_gathers_the_chain_into_one_tree() {
    let (mut ctx, _dev) = fixture();
    let manager = BoManager::new(1 << 20, 1 << 20);
    let mut tobj = TexObj::new(1);
    tobj.set_level_range(0, 2);
    tobj.set_image(0, 0, system_image(64, 64, 1));
    tobj.set_image(0, 1, system_image(32, 32, 2));
    tobj.set_image(0, 2, system_image(16, 16, 3));

    assert!(ctx.validate_texture(&manager, &mut tobj).unwrap());
    assert!(tobj.is_validated());
    let tree = tobj.mt().unwrap().clone();
    for level in 0..=2 {
        let img = tobj.image(0, level).unwrap();
        assert!(img.in_tree(&tree, 0, level));
    }
}

#[test]
fn missing_level_falls_back_to_software() {
    let (mut ctx, _dev) = fixture();
    let manager = BoManager::new(1 << 20, 1 << 20);
    let mut tobj = TexObj::new(1);
    tobj.set_level_range(0, 2);
    tobj.set_image(0, 0, system_image(64, 64, 1));
    tobj.set_image(0, 2, system_image(16, 16, 3));

    assert!(!ctx.validate_texture(&manager, &mut tobj).unwrap());
    assert!(tobj.mt().is_none());
    assert!(!tobj.is_validated());
}

#[test]
fn geometry_mismatch_fails_the_whole_chain() {
    let (mut ctx, _dev) = fixture();
    let manager = BoManager::new(1 << 20, 1 << 20);
    let mut tobj = TexObj::new(1);
    tobj.set_level_range(0, 2);
    tobj.set_image(0, 0, system_image(64, 64, 1));
    tobj.set_image(0, 1, system_image(32, 32, 2));
    tobj.set_image(0, 2, system_image(9, 9, 3));

    assert!(!ctx.validate_texture(&manager, &mut tobj).unwrap());
    // Nothing moved, not even the levels that did match.
    for level in 0..=2 {
        assert!(tobj.image(0, level).unwrap().tree().is_none());
    }
}

#[test]
fn validate_fails_when_no_domain_has_room() {
    let (mut ctx, _dev) = fixture();
    let manager = BoManager::new(256, 256);
    let mut tobj = TexObj::new(1);
    tobj.set_level_range(0, 0);
    tobj.set_image(0, 0, system_image(64, 64, 1));

    assert!(!ctx.validate_texture(&manager, &mut tobj).unwrap());
    assert!(tobj.mt().is_none());
}

#[test]
fn set_teximage_flushes_only_when_storage_is_referenced() {
    let (mut ctx, dev) = fixture();
    let manager = BoManager::new(1 << 20, 1 << 20);
    let mut tobj = TexObj::new(1);
    tobj.set_level_range(0, 0);
    tobj.set_image(0, 0, system_image(16, 16, 7));
    assert!(ctx.validate_texture(&manager, &mut tobj).unwrap());

    // Queue a draw, then replace the level while unreferenced: no flush.
    let mut batch = ctx.begin_batch(2, false).unwrap();
    batch.emit(packet_header(1));
    batch.emit(0);
    drop(batch);
    ctx.set_teximage(&mut tobj, 0, 0, system_image(16, 16, 8))
        .unwrap();
    assert_eq!(dev.counters().submissions, 0);

    // Re-validate, reference the tree's buffer, replace again: the queued
    // commands go out first.
    assert!(ctx.validate_texture(&manager, &mut tobj).unwrap());
    let bo = tobj.mt().unwrap().bo().clone();
    ctx.reference_bo(&bo);
    assert!(ctx.is_bo_referenced(&bo));
    ctx.set_teximage(&mut tobj, 0, 0, system_image(16, 16, 9))
        .unwrap();
    assert_eq!(dev.counters().submissions, 1);
    // Replacement always invalidates residency.
    assert!(!tobj.is_validated());
}
