/// How blocks of a layout may be rearranged when packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PackStrategy {
    /// The grid grows to fit every block.
    #[default]
    Resizable,
    /// The grid keeps its size; blocks shrink to fit.
    Fixed,
    /// Blocks overlap the base layout instead of being packed.
    Overlay,
}

/// A rectangle of a layout grid, in grid cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBlock {
    pub id: u64,
    pub min: [u16; 2],
    pub size: [u16; 2],
    pub priority: i32,
}

impl LayoutBlock {
    pub const fn new(id: u64, min: [u16; 2], size: [u16; 2]) -> Self {
        Self {
            id,
            min,
            size,
            priority: 0,
        }
    }
}

/// Texture layout of one UV channel: a grid and the blocks placed on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Layout {
    pub grid_size: [u16; 2],
    pub max_grid_size: [u16; 2],
    pub blocks: Vec<LayoutBlock>,
    pub strategy: PackStrategy,
}

impl Layout {
    pub fn new(grid_size: [u16; 2], strategy: PackStrategy) -> Self {
        Self {
            grid_size,
            max_grid_size: grid_size,
            blocks: Vec::new(),
            strategy,
        }
    }

    pub fn with_block(mut self, block: LayoutBlock) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn block(&self, id: u64) -> Option<&LayoutBlock> {
        self.blocks.iter().find(|block| block.id == id)
    }

    /// Pixel size of `block` on a texture of `texture_size` pixels.
    ///
    /// Returns `None` for an empty grid.
    pub fn block_pixel_size(&self, block: &LayoutBlock, texture_size: [u32; 2]) -> Option<[u32; 2]> {
        if self.grid_size.contains(&0) {
            return None;
        }
        Some([
            texture_size[0] / self.grid_size[0] as u32 * block.size[0] as u32,
            texture_size[1] / self.grid_size[1] as u32 * block.size[1] as u32,
        ])
    }
}
