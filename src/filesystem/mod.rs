//! Layer filesystem model: decoded tar trees and the build overlay

mod layerfs;
mod tree;

pub use layerfs::{clean_path, LayerFS};
pub use tree::{
    decode_tree, layer_tree, NodeHeader, NodeKind, TreeNode, WHITEOUT_META_PREFIX,
    WHITEOUT_OPAQUE_DIR, WHITEOUT_PREFIX,
};
