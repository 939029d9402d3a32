//! 购物车存储
//!
//! 购物车按用户整体读写（单行 upsert），改价是唯一的批量写入。

mod cart_repo;
mod memory;
mod traits;

pub use cart_repo::CartRepository;
pub use memory::InMemoryCartRepository;
pub use traits::*;
