//! Deep-tensor tile grid: layout of four-channel tiles inside one texture, and the proxy-polygon
//! geometry each tile needs for a render pass.

/// One four-channel tile inside a deep-format texture.
///
/// `(x0, y0, x1, y1)` is the polygon in normalized device coordinates (`[-1, 1]`); `(u0, v0, u1,
/// v1)` is the matching region in texture space (`[0, 1]`). `channel_base` is the first of the
/// four channels this tile represents.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tile {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
    pub u0: f32,
    pub v0: f32,
    pub u1: f32,
    pub v1: f32,
    pub channel_base: u32,
}

/// Computes the tile grid for a deep tensor and hands out per-tile geometry.
///
/// Tile ordering is fixed: channel `4k` occupies column `k / rows`, row `k % rows` (column-major
/// within the texture). The grid is chosen so the enclosing texture is as close to square as
/// possible while respecting `max_texture_dim`.
#[derive(Clone, Debug)]
pub struct Tiler {
    /// Per-tile width/height, i.e. `width + 2*pad` / `height + 2*pad`.
    tile_width: u32,
    tile_height: u32,
    rows: u32,
    cols: u32,
    channels: u32,
}

impl Tiler {
    /// Build a tiler for `channels` channels of spatial size `width x height` with symmetric
    /// padding `pad`, inside a texture no larger than `max_texture_dim` on either axis.
    ///
    /// Returns `None` if even a single tile does not fit within `max_texture_dim`, or if the
    /// minimal tile count can't be arranged within the limit at all.
    pub fn new(
        width: u32,
        height: u32,
        channels: u32,
        pad: u32,
        max_texture_dim: u32,
    ) -> Option<Self> {
        let tile_width = width + 2 * pad;
        let tile_height = height + 2 * pad;
        if tile_width == 0 || tile_height == 0 || tile_width > max_texture_dim || tile_height > max_texture_dim {
            return None;
        }

        let num_tiles = channels.div_ceil(4).max(1);
        let max_cols = max_texture_dim / tile_width;
        let max_rows = max_texture_dim / tile_height;
        if max_cols == 0 || max_rows == 0 {
            return None;
        }

        // Choose rows/cols close to square: start from ceil(sqrt(num_tiles)) rows and grow
        // outward until both axis limits and the "at most one short column" invariant hold.
        let mut rows = (num_tiles as f64).sqrt().ceil() as u32;
        rows = rows.clamp(1, max_rows);
        let mut cols = num_tiles.div_ceil(rows);
        while cols > max_cols && rows < max_rows {
            rows += 1;
            cols = num_tiles.div_ceil(rows);
        }
        if cols > max_cols {
            return None;
        }

        Some(Tiler {
            tile_width,
            tile_height,
            rows,
            cols,
            channels,
        })
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    /// Total texel extent of the enclosing texture.
    pub fn texture_extent(&self) -> (u32, u32) {
        (self.tile_width * self.cols, self.tile_height * self.rows)
    }

    /// Number of four-channel tiles actually carrying data (as opposed to grid capacity).
    pub fn num_tiles(&self) -> u32 {
        self.channels.div_ceil(4).max(1)
    }

    /// Geometry for the tile holding channels `[4*tile_index, 4*tile_index+4)`.
    ///
    /// Tile ordering is column-major: tile `k` sits at column `k / rows`, row `k % rows`.
    pub fn tile(&self, tile_index: u32) -> Tile {
        debug_assert!(tile_index < self.num_tiles());
        let col = tile_index / self.rows;
        let row = tile_index % self.rows;

        let (tex_w, tex_h) = self.texture_extent();
        let u0 = (col * self.tile_width) as f32 / tex_w as f32;
        let u1 = ((col + 1) * self.tile_width) as f32 / tex_w as f32;
        // Texture-space v grows downward; NDC y grows upward, so row 0 maps to the top strip.
        let v0 = (row * self.tile_height) as f32 / tex_h as f32;
        let v1 = ((row + 1) * self.tile_height) as f32 / tex_h as f32;

        Tile {
            x0: -1.0,
            y0: -1.0,
            x1: 1.0,
            y1: 1.0,
            u0,
            v0,
            u1,
            v1,
            channel_base: tile_index * 4,
        }
    }

    /// Iterate over all tiles carrying data, in tile-index order.
    pub fn tiles(&self) -> impl Iterator<Item = Tile> + '_ {
        (0..self.num_tiles()).map(move |i| self.tile(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_covers_all_tiles_with_at_most_one_short_column() {
        // 13 channels -> 4 tiles (ceil(13/4)). With a generous max dim we expect a near-square
        // grid; since 4 tiles make a perfect 2x2 the slack column invariant is trivially 0.
        let tiler = Tiler::new(8, 8, 13, 0, 4096).unwrap();
        let r = tiler.rows();
        let k = tiler.cols();
        let num_tiles = tiler.num_tiles();
        assert!(r * k >= num_tiles);
        assert!(r * k - num_tiles <= r - 1);
    }

    #[test]
    fn tiles_are_ordered_column_major() {
        // 9 tiles (36 channels), force 3 rows so layout is deterministic for the assertion.
        let tiler = Tiler::new(4, 4, 36, 0, 4096).unwrap();
        let rows = tiler.rows();
        for k in 0..tiler.num_tiles() {
            let tile = tiler.tile(k);
            let expected_col = k / rows;
            let expected_row = k % rows;
            // Recover column/row from u0/v0 by inverting the linear mapping.
            let (tex_w, tex_h) = tiler.texture_extent();
            let tile_w = tex_w / tiler.cols();
            let tile_h = tex_h / rows;
            let col = (tile.u0 * tex_w as f32).round() as u32 / tile_w;
            let row = (tile.v0 * tex_h as f32).round() as u32 / tile_h;
            assert_eq!(col, expected_col);
            assert_eq!(row, expected_row);
        }
    }

    #[test]
    fn rejects_tiles_larger_than_max_dim() {
        assert!(Tiler::new(4096, 4096, 4, 0, 2048).is_none());
    }
}
