//! gRPC 协议定义
//!
//! 按 proto package 组织模块层级，跨 package 的引用（如 `bookstore.common.Money`）
//! 在生成代码中表现为 `super::common::Money`。

pub mod bookstore {
    pub mod common {
        tonic::include_proto!("bookstore.common");
    }

    pub mod cart {
        tonic::include_proto!("bookstore.cart");
    }

    pub mod payment {
        tonic::include_proto!("bookstore.payment");
    }

    pub mod catalog {
        tonic::include_proto!("bookstore.catalog");
    }

    pub mod order {
        tonic::include_proto!("bookstore.order");
    }
}

pub use bookstore::{cart, catalog, common, order, payment};
