//! Miptrees: one buffer object laid out to hold a texture's mipmap levels
//! and cube faces.
//!
//! The layout walks levels from `first_level` to `last_level`, halving
//! dimensions (floor, minimum 1) per step. Rowstrides are padded to the
//! hardware pitch alignment and every image offset inherits it, so the
//! sampler can address any face of any level from one base offset. A tree
//! is immutable once allocated; textures whose geometry stops matching get
//! a new tree and their images are migrated over.

use std::rc::Rc;

use crate::bo::{BoDomain, BoFlags, BoHandle, BoManager};

/// Pitch alignment in bytes for every level of every texture.
pub const MIPTREE_ROWSTRIDE_ALIGN: u32 = 32;

/// Face count of a cube-map tree; every other target has one face.
pub const CUBE_FACES: u32 = 6;

fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

fn minify(base: u32, steps: u32) -> u32 {
    (base >> steps).max(1)
}

/// Geometry of one level, shared by all faces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MipLevel {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Bytes per row, pitch-aligned.
    pub rowstride: u32,
    /// Bytes of one face at this level.
    pub size: u32,
    /// Byte offset of each face within the buffer.
    pub face_offsets: Vec<u32>,
}

#[derive(Debug)]
pub struct Miptree {
    bo: BoHandle,
    faces: u32,
    first_level: u32,
    last_level: u32,
    width0: u32,
    height0: u32,
    depth0: u32,
    cpp: u32,
    total_size: u32,
    levels: Vec<MipLevel>,
}

impl Miptree {
    /// Lay out and allocate a tree. `width0`/`height0`/`depth0` are the
    /// dimensions *at `first_level`*. Returns `None` when no memory domain
    /// can hold it, which callers treat as an ordinary allocation failure.
    #[allow(clippy::too_many_arguments)]
    pub fn try_alloc(
        manager: &BoManager,
        faces: u32,
        first_level: u32,
        last_level: u32,
        width0: u32,
        height0: u32,
        depth0: u32,
        cpp: u32,
    ) -> Option<Rc<Miptree>> {
        assert!(faces == 1 || faces == CUBE_FACES, "bad face count {faces}");
        assert!(first_level <= last_level, "empty level range");
        assert!(width0 > 0 && height0 > 0 && depth0 > 0 && cpp > 0);

        let mut levels = Vec::with_capacity((last_level - first_level + 1) as usize);
        let mut total_size = 0u32;
        for level in first_level..=last_level {
            let steps = level - first_level;
            let width = minify(width0, steps);
            let height = minify(height0, steps);
            let depth = if faces == CUBE_FACES {
                1
            } else {
                minify(depth0, steps)
            };
            let rowstride = align_up(width * cpp, MIPTREE_ROWSTRIDE_ALIGN);
            let size = rowstride * height * depth;
            let face_offsets = (0..faces).map(|face| total_size + face * size).collect();
            total_size += size * faces;
            levels.push(MipLevel {
                width,
                height,
                depth,
                rowstride,
                size,
                face_offsets,
            });
        }

        let bo = manager.open(
            u64::from(total_size),
            MIPTREE_ROWSTRIDE_ALIGN,
            BoDomain::VRAM | BoDomain::GART,
            BoFlags::default(),
        )?;
        Some(Rc::new(Miptree {
            bo,
            faces,
            first_level,
            last_level,
            width0,
            height0,
            depth0,
            cpp,
            total_size,
            levels,
        }))
    }

    pub fn bo(&self) -> &BoHandle {
        &self.bo
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

    pub fn cpp(&self) -> u32 {
        self.cpp
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn contains_level(&self, level: u32) -> bool {
        (self.first_level..=self.last_level).contains(&level)
    }

    pub fn level(&self, level: u32) -> &MipLevel {
        assert!(self.contains_level(level), "level {level} not in tree");
        &self.levels[(level - self.first_level) as usize]
    }

    /// Byte offset of `(face, level)` within the buffer.
    pub fn image_offset(&self, face: u32, level: u32) -> u32 {
        assert!(face < self.faces, "face {face} not in tree");
        self.level(level).face_offsets[face as usize]
    }

    /// Whether an image with the given geometry belongs at `(face, level)`
    /// of this tree.
    pub fn matches_image(
        &self,
        face: u32,
        level: u32,
        width: u32,
        height: u32,
        depth: u32,
        cpp: u32,
    ) -> bool {
        if face >= self.faces || !self.contains_level(level) || cpp != self.cpp {
            return false;
        }
        let lv = self.level(level);
        lv.width == width && lv.height == height && lv.depth == depth
    }

    /// Whether this tree covers exactly the mipmap range and base geometry
    /// of a texture object.
    #[allow(clippy::too_many_arguments)]
    pub fn matches_object(
        &self,
        faces: u32,
        first_level: u32,
        last_level: u32,
        width0: u32,
        height0: u32,
        depth0: u32,
        cpp: u32,
    ) -> bool {
        self.faces == faces
            && self.first_level == first_level
            && self.last_level == last_level
            && self.width0 == width0
            && self.height0 == height0
            && self.depth0 == depth0
            && self.cpp == cpp
    }
}

/// Copy `rows` rows of `row_bytes` between differently strided buffers.
/// Collapses to a single copy when both strides equal the row size.
pub fn copy_rows(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    src_stride: usize,
    rows: usize,
    row_bytes: usize,
) {
    assert!(row_bytes <= dst_stride || rows <= 1, "destination stride too small");
    assert!(row_bytes <= src_stride || rows <= 1, "source stride too small");
    if rows == 0 || row_bytes == 0 {
        return;
    }
    if dst_stride == row_bytes && src_stride == row_bytes {
        dst[..rows * row_bytes].copy_from_slice(&src[..rows * row_bytes]);
        return;
    }
    for row in 0..rows {
        dst[row * dst_stride..row * dst_stride + row_bytes]
            .copy_from_slice(&src[row * src_stride..row * src_stride + row_bytes]);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn manager() -> BoManager {
        BoManager::new(1 << 24, 1 << 24)
    }

    #[test]
    fn lays_out_a_2d_chain() {
        let mgr = manager();
        // 61x32 at 2 bytes per pixel: the odd width exercises pitch padding.
        let tree = Miptree::try_alloc(&mgr, 1, 0, 2, 61, 32, 1, 2).unwrap();

        let l0 = tree.level(0);
        assert_eq!((l0.width, l0.height), (61, 32));
        assert_eq!(l0.rowstride, 128); // 122 padded to 32
        assert_eq!(l0.size, 128 * 32);

        let l1 = tree.level(1);
        assert_eq!((l1.width, l1.height), (30, 16));
        assert_eq!(l1.rowstride, 64); // 60 padded
        let l2 = tree.level(2);
        assert_eq!((l2.width, l2.height), (15, 8));
        assert_eq!(l2.rowstride, 32);

        assert_eq!(tree.image_offset(0, 0), 0);
        assert_eq!(tree.image_offset(0, 1), 128 * 32);
        assert_eq!(tree.image_offset(0, 2), 128 * 32 + 64 * 16);
        assert_eq!(tree.total_size(), 128 * 32 + 64 * 16 + 32 * 8);
        assert_eq!(u64::from(tree.total_size()), tree.bo().size());
    }

    #[test]
    fn lays_out_cube_faces() {
        let mgr = manager();
        let tree = Miptree::try_alloc(&mgr, CUBE_FACES, 0, 1, 8, 8, 1, 4).unwrap();
        let l0 = tree.level(0);
        assert_eq!(l0.rowstride, 32);
        assert_eq!(l0.size, 32 * 8);
        assert_eq!(tree.image_offset(0, 0), 0);
        assert_eq!(tree.image_offset(1, 0), 32 * 8);
        assert_eq!(tree.image_offset(5, 0), 5 * 32 * 8);
        // Level 1 faces start after all six level-0 faces.
        assert_eq!(tree.image_offset(0, 1), 6 * 32 * 8);
        assert_eq!(tree.image_offset(1, 1), 6 * 32 * 8 + 32 * 4);
    }

    #[test]
    fn nonzero_first_level_uses_base_dimensions() {
        let mgr = manager();
        // Dimensions are given at the first level, not level zero.
        let tree = Miptree::try_alloc(&mgr, 1, 2, 4, 16, 16, 1, 4).unwrap();
        assert_eq!(tree.level(2).width, 16);
        assert_eq!(tree.level(3).width, 8);
        assert_eq!(tree.level(4).width, 4);
        assert!(!tree.contains_level(1));
        assert!(!tree.contains_level(5));
    }

    #[test]
    fn image_matching() {
        let mgr = manager();
        let tree = Miptree::try_alloc(&mgr, 1, 0, 2, 64, 64, 1, 2).unwrap();
        assert!(tree.matches_image(0, 1, 32, 32, 1, 2));
        assert!(!tree.matches_image(0, 1, 32, 32, 1, 4)); // wrong cpp
        assert!(!tree.matches_image(0, 1, 31, 32, 1, 2)); // wrong width
        assert!(!tree.matches_image(1, 1, 32, 32, 1, 2)); // not a cube
        assert!(!tree.matches_image(0, 3, 8, 8, 1, 2)); // level out of range
    }

    #[test]
    fn object_matching_is_exact() {
        let mgr = manager();
        let tree = Miptree::try_alloc(&mgr, 1, 0, 2, 64, 64, 1, 2).unwrap();
        assert!(tree.matches_object(1, 0, 2, 64, 64, 1, 2));
        assert!(!tree.matches_object(1, 0, 1, 64, 64, 1, 2));
        assert!(!tree.matches_object(1, 1, 2, 64, 64, 1, 2));
        assert!(!tree.matches_object(CUBE_FACES, 0, 2, 64, 64, 1, 2));
    }

    #[test]
    fn try_alloc_fails_cleanly_without_memory() {
        let mgr = BoManager::new(64, 64);
        assert!(Miptree::try_alloc(&mgr, 1, 0, 0, 128, 128, 1, 4).is_none());
    }

    #[test]
    fn copy_rows_collapses_when_packed() {
        let src: Vec<u8> = (0..64).collect();
        let mut dst = vec![0u8; 64];
        copy_rows(&mut dst, 16, &src, 16, 4, 16);
        assert_eq!(dst, src);
    }

    #[test]
    fn copy_rows_repitches_packed_rows() {
        // 4 packed rows of 384 bytes land at 512-byte stride offsets.
        let src: Vec<u8> = (0..4 * 384).map(|i| (i % 251) as u8).collect();
        let mut dst = vec![0u8; 4 * 512];
        copy_rows(&mut dst, 512, &src, 384, 4, 384);
        for row in 0..4 {
            assert_eq!(
                &dst[row * 512..row * 512 + 384],
                &src[row * 384..(row + 1) * 384]
            );
            // The pitch padding stays untouched.
            assert!(dst[row * 512 + 384..(row + 1) * 512].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn copy_rows_respects_strides() {
        // 3 rows of 4 bytes, source stride 8, destination stride 6.
        let mut src = vec![0u8; 24];
        for row in 0..3 {
            for b in 0..4 {
                src[row * 8 + b] = (row * 10 + b) as u8;
            }
        }
        let mut dst = vec![0xffu8; 18];
        copy_rows(&mut dst, 6, &src, 8, 3, 4);
        for row in 0..3 {
            for b in 0..4 {
                assert_eq!(dst[row * 6 + b], (row * 10 + b) as u8);
            }
            // Stride padding is untouched.
            assert_eq!(dst[row * 6 + 4], 0xff);
            assert_eq!(dst[row * 6 + 5], 0xff);
        }
    }
}
