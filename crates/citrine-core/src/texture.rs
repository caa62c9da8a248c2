//! Texture objects, their images, and miptree validation.
//!
//! An image starts life in system memory. Validation gathers every image of
//! a texture into one miptree so the sampler sees a single base offset:
//! it picks a tree that matches the object's geometry (preferring the base
//! image's tree, then the object's cached tree, then a fresh allocation)
//! and migrates every image that is not already in place. Migration maps
//! the buffers involved, which stalls on pending engine work, so no copy
//! can overtake a queued draw that samples the old bits.

use std::rc::Rc;

use citrine_drm::DrmDevice;
use tracing::debug;

use crate::bo::BoManager;
use crate::error::Result;
use crate::miptree::{copy_rows, Miptree, CUBE_FACES};

/// Fixed level capacity of a texture object, enough for a 4096-wide base.
pub const MAX_TEXTURE_LEVELS: u32 = 13;

/// Where an image's bytes currently live.
#[derive(Debug)]
pub enum TexBacking {
    /// Malloced client data with its own rowstride.
    System { data: Vec<u8>, rowstride: u32 },
    /// Resident at `(face, level)` of a miptree.
    Tree {
        tree: Rc<Miptree>,
        face: u32,
        level: u32,
    },
}

#[derive(Debug)]
pub struct TexImage {
    width: u32,
    height: u32,
    depth: u32,
    cpp: u32,
    backing: TexBacking,
}

impl TexImage {
    /// An image over caller-provided system memory. `data` must cover
    /// `height * depth` rows of `rowstride` bytes (the last row may stop at
    /// the pixel data's edge).
    pub fn new_system(
        width: u32,
        height: u32,
        depth: u32,
        cpp: u32,
        rowstride: u32,
        data: Vec<u8>,
    ) -> Self {
        assert!(width > 0 && height > 0 && depth > 0 && cpp > 0);
        assert!(rowstride >= width * cpp, "rowstride smaller than a row");
        let rows = height * depth;
        let need = (rows - 1) as usize * rowstride as usize + (width * cpp) as usize;
        assert!(data.len() >= need, "image data shorter than its geometry");
        Self {
            width,
            height,
            depth,
            cpp,
            backing: TexBacking::System { data, rowstride },
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn cpp(&self) -> u32 {
        self.cpp
    }

    pub fn backing(&self) -> &TexBacking {
        &self.backing
    }

    /// The tree this image resides in, if any.
    pub fn tree(&self) -> Option<&Rc<Miptree>> {
        match &self.backing {
            TexBacking::Tree { tree, .. } => Some(tree),
            TexBacking::System { .. } => None,
        }
    }

    /// Whether the image already sits at `(face, level)` of `tree`.
    pub fn in_tree(&self, tree: &Rc<Miptree>, face: u32, level: u32) -> bool {
        match &self.backing {
            TexBacking::Tree {
                tree: t,
                face: f,
                level: l,
            } => Rc::ptr_eq(t, tree) && *f == face && *l == level,
            TexBacking::System { .. } => false,
        }
    }
}

/// A texture object: per-face, per-level images plus the cached miptree.
#[derive(Debug)]
pub struct TexObj {
    faces: u32,
    first_level: u32,
    last_level: u32,
    images: Vec<Vec<Option<TexImage>>>,
    mt: Option<Rc<Miptree>>,
    validated: bool,
}

impl TexObj {
    pub fn new(faces: u32) -> Self {
        assert!(faces == 1 || faces == CUBE_FACES, "bad face count {faces}");
        Self {
            faces,
            first_level: 0,
            last_level: 0,
            images: (0..faces)
                .map(|_| (0..MAX_TEXTURE_LEVELS).map(|_| None).collect())
                .collect(),
            mt: None,
            validated: false,
        }
    }

    pub fn faces(&self) -> u32 {
        self.faces
    }

    pub fn first_level(&self) -> u32 {
        self.first_level
    }

    pub fn last_level(&self) -> u32 {
        self.last_level
    }

    /// Set the mipmap range the sampler will use. Invalidates validation.
    pub fn set_level_range(&mut self, first_level: u32, last_level: u32) {
        assert!(first_level <= last_level && last_level < MAX_TEXTURE_LEVELS);
        self.first_level = first_level;
        self.last_level = last_level;
        self.validated = false;
    }

    pub fn image(&self, face: u32, level: u32) -> Option<&TexImage> {
        self.images[face as usize][level as usize].as_ref()
    }

    pub fn image_mut(&mut self, face: u32, level: u32) -> Option<&mut TexImage> {
        self.images[face as usize][level as usize].as_mut()
    }

    /// Install image data at `(face, level)`, replacing what was there.
    pub fn set_image(&mut self, face: u32, level: u32, image: TexImage) {
        assert!(face < self.faces && level < MAX_TEXTURE_LEVELS);
        self.images[face as usize][level as usize] = Some(image);
        self.validated = false;
    }

    /// The image at the first sampled level, which defines the object's
    /// geometry.
    pub fn base_image(&self) -> Option<&TexImage> {
        self.image(0, self.first_level)
    }

    pub fn mt(&self) -> Option<&Rc<Miptree>> {
        self.mt.as_ref()
    }

    pub fn set_mt(&mut self, mt: Option<Rc<Miptree>>) {
        self.mt = mt;
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    pub(crate) fn set_validated(&mut self, validated: bool) {
        self.validated = validated;
    }
}

/// Gather every sampled image of `tobj` into one matching miptree.
///
/// Returns `Ok(false)` when the object cannot be made resident: a level is
/// missing, an image disagrees with the base geometry, or no memory domain
/// can hold a new tree. Those are fallback conditions for the caller, not
/// errors.
pub fn validate_texture(
    device: &mut dyn DrmDevice,
    manager: &BoManager,
    tobj: &mut TexObj,
) -> Result<bool> {
    let faces = tobj.faces();
    let (first, last) = (tobj.first_level(), tobj.last_level());
    for face in 0..faces {
        for level in first..=last {
            if tobj.image(face, level).is_none() {
                return Ok(false);
            }
        }
    }
    let Some(base) = tobj.base_image() else {
        return Ok(false);
    };
    let (w0, h0, d0, cpp) = (base.width(), base.height(), base.depth(), base.cpp());

    // Candidate tree: the base image's own tree wins over the object's
    // cached one, so a freshly respecified base pulls the rest over to it
    // instead of being copied back into stale storage.
    let candidate = if let Some(tree) = base
        .tree()
        .filter(|t| t.matches_object(faces, first, last, w0, h0, d0, cpp))
    {
        Rc::clone(tree)
    } else if let Some(tree) = tobj
        .mt()
        .filter(|t| t.matches_object(faces, first, last, w0, h0, d0, cpp))
    {
        Rc::clone(tree)
    } else {
        match Miptree::try_alloc(manager, faces, first, last, w0, h0, d0, cpp) {
            Some(tree) => tree,
            None => return Ok(false),
        }
    };

    // Every image must agree with the candidate's geometry before anything
    // moves, so a broken chain falls back as a whole.
    for face in 0..faces {
        for level in first..=last {
            let Some(img) = tobj.image(face, level) else {
                return Ok(false);
            };
            if !candidate.matches_image(face, level, img.width(), img.height(), img.depth(), img.cpp())
            {
                return Ok(false);
            }
        }
    }

    for face in 0..faces {
        for level in first..=last {
            let Some(img) = tobj.image_mut(face, level) else {
                return Ok(false);
            };
            if !img.in_tree(&candidate, face, level) {
                migrate_image(device, &candidate, img, face, level)?;
            }
        }
    }

    tobj.set_mt(Some(candidate));
    tobj.set_validated(true);
    Ok(true)
}

/// Move one image into `(face, level)` of `tree`. A no-op when it is
/// already there. Maps stall on pending engine work, so the copy cannot
/// overtake queued draws reading the old storage.
pub fn migrate_image(
    device: &mut dyn DrmDevice,
    tree: &Rc<Miptree>,
    image: &mut TexImage,
    face: u32,
    level: u32,
) -> Result<()> {
    if image.in_tree(tree, face, level) {
        return Ok(());
    }
    debug_assert!(tree.matches_image(
        face,
        level,
        image.width,
        image.height,
        image.depth,
        image.cpp
    ));
    let lv = tree.level(level);
    let offset = tree.image_offset(face, level) as usize;
    let rows = (lv.height * lv.depth) as usize;
    let row_bytes = (lv.width * tree.cpp()) as usize;
    let dst_stride = lv.rowstride as usize;
    let dst_size = lv.size as usize;
    debug!(face, level, rows, "migrating texture image");

    tree.bo().map(device)?;
    let old = std::mem::replace(
        &mut image.backing,
        TexBacking::Tree {
            tree: Rc::clone(tree),
            face,
            level,
        },
    );
    match old {
        TexBacking::System { data, rowstride } => {
            let mut dst = tree.bo().data_mut();
            copy_rows(
                &mut dst[offset..offset + dst_size],
                dst_stride,
                &data,
                rowstride as usize,
                rows,
                row_bytes,
            );
        }
        TexBacking::Tree {
            tree: old_tree,
            face: old_face,
            level: old_level,
        } => {
            let src_lv = old_tree.level(old_level);
            let src_off = old_tree.image_offset(old_face, old_level) as usize;
            let src_stride = src_lv.rowstride as usize;
            let src_size = src_lv.size as usize;
            if old_tree.bo().ptr_eq(tree.bo()) {
                // Same backing store: stage through a packed temporary.
                let mut tmp = vec![0u8; rows * row_bytes];
                {
                    let src = tree.bo().data();
                    copy_rows(
                        &mut tmp,
                        row_bytes,
                        &src[src_off..src_off + src_size],
                        src_stride,
                        rows,
                        row_bytes,
                    );
                }
                let mut dst = tree.bo().data_mut();
                copy_rows(
                    &mut dst[offset..offset + dst_size],
                    dst_stride,
                    &tmp,
                    row_bytes,
                    rows,
                    row_bytes,
                );
            } else {
                old_tree.bo().map(device)?;
                {
                    let src = old_tree.bo().data();
                    let mut dst = tree.bo().data_mut();
                    copy_rows(
                        &mut dst[offset..offset + dst_size],
                        dst_stride,
                        &src[src_off..src_off + src_size],
                        src_stride,
                        rows,
                        row_bytes,
                    );
                }
                old_tree.bo().unmap();
            }
        }
    }
    tree.bo().unmap();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use citrine_drm::{Sarea, SoftDevice};
    use pretty_assertions::assert_eq;

    use super::*;

    fn setup() -> (SoftDevice, BoManager) {
        let sarea = Arc::new(Sarea::new());
        (SoftDevice::new(sarea), BoManager::new(1 << 24, 1 << 24))
    }

    fn image(width: u32, height: u32, fill: u8) -> TexImage {
        let rowstride = width * 2 + 6; // deliberately padded
        let data = vec![fill; (rowstride * height) as usize];
        TexImage::new_system(width, height, 1, 2, rowstride, data)
    }

    #[test]
    fn missing_levels_fail_validation() {
        let (mut dev, mgr) = setup();
        let mut tobj = TexObj::new(1);
        tobj.set_level_range(0, 1);
        tobj.set_image(0, 0, image(8, 8, 1));
        assert!(!validate_texture(&mut dev, &mgr, &mut tobj).unwrap());
        assert!(!tobj.is_validated());
    }

    #[test]
    fn validation_builds_a_tree_and_migrates() {
        let (mut dev, mgr) = setup();
        let mut tobj = TexObj::new(1);
        tobj.set_level_range(0, 1);
        tobj.set_image(0, 0, image(8, 8, 0xaa));
        tobj.set_image(0, 1, image(4, 4, 0xbb));

        assert!(validate_texture(&mut dev, &mgr, &mut tobj).unwrap());
        assert!(tobj.is_validated());
        let tree = tobj.mt().unwrap().clone();

        // Both images now live in the tree.
        assert!(tobj.image(0, 0).unwrap().in_tree(&tree, 0, 0));
        assert!(tobj.image(0, 1).unwrap().in_tree(&tree, 0, 1));

        // Pixel rows landed at the tree's stride.
        tree.bo().map(&mut dev).unwrap();
        {
            let data = tree.bo().data();
            let l1 = tree.level(1);
            let off = tree.image_offset(0, 1) as usize;
            for row in 0..4 {
                let at = off + row * l1.rowstride as usize;
                assert_eq!(&data[at..at + 8], &[0xbb; 8]);
            }
        }
        tree.bo().unmap();
    }

    #[test]
    fn revalidation_is_stable() {
        let (mut dev, mgr) = setup();
        let mut tobj = TexObj::new(1);
        tobj.set_level_range(0, 0);
        tobj.set_image(0, 0, image(16, 4, 3));
        assert!(validate_texture(&mut dev, &mgr, &mut tobj).unwrap());
        let first = tobj.mt().unwrap().clone();

        // Nothing changed: same tree, no new allocation.
        assert!(validate_texture(&mut dev, &mgr, &mut tobj).unwrap());
        assert!(Rc::ptr_eq(&first, tobj.mt().unwrap()));
    }

    #[test]
    fn base_image_tree_wins_over_the_cached_tree() {
        let (mut dev, mgr) = setup();
        let mut tobj = TexObj::new(1);
        tobj.set_level_range(0, 1);
        tobj.set_image(0, 0, image(8, 8, 0xaa));
        tobj.set_image(0, 1, image(4, 4, 0xbb));
        assert!(validate_texture(&mut dev, &mgr, &mut tobj).unwrap());
        let cached = tobj.mt().unwrap().clone();

        // Respecify the base into a tree of its own, as an upload path
        // that could not write in place would.
        let fresh = Miptree::try_alloc(&mgr, 1, 0, 1, 8, 8, 1, 2).unwrap();
        migrate_image(&mut dev, &fresh, tobj.image_mut(0, 0).unwrap(), 0, 0).unwrap();

        // Validation adopts the base image's tree and pulls level 1 over,
        // rather than copying the base back into the cached tree.
        assert!(validate_texture(&mut dev, &mgr, &mut tobj).unwrap());
        assert!(Rc::ptr_eq(tobj.mt().unwrap(), &fresh));
        assert!(!Rc::ptr_eq(tobj.mt().unwrap(), &cached));
        assert!(tobj.image(0, 1).unwrap().in_tree(&fresh, 0, 1));

        fresh.bo().map(&mut dev).unwrap();
        {
            let data = fresh.bo().data();
            let off = fresh.image_offset(0, 1) as usize;
            let stride = fresh.level(1).rowstride as usize;
            for row in 0..4 {
                let at = off + row * stride;
                assert_eq!(&data[at..at + 8], &[0xbb; 8]);
            }
        }
        fresh.bo().unmap();
    }

    #[test]
    fn geometry_mismatch_fails_validation() {
        let (mut dev, mgr) = setup();
        let mut tobj = TexObj::new(1);
        tobj.set_level_range(0, 1);
        tobj.set_image(0, 0, image(8, 8, 1));
        tobj.set_image(0, 1, image(8, 8, 2)); // should be 4x4
        assert!(!validate_texture(&mut dev, &mgr, &mut tobj).unwrap());
    }

    #[test]
    fn allocation_failure_is_a_clean_fallback() {
        let (mut dev, _) = setup();
        let tiny = BoManager::new(16, 16);
        let mut tobj = TexObj::new(1);
        tobj.set_level_range(0, 0);
        tobj.set_image(0, 0, image(64, 64, 1));
        assert!(!validate_texture(&mut dev, &tiny, &mut tobj).unwrap());
        assert!(tobj.mt().is_none());
    }
}
