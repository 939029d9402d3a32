//! 编译 proto 定义，生成 gRPC 服务端与客户端代码

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protos = [
        "proto/bookstore/common.proto",
        "proto/bookstore/cart.proto",
        "proto/bookstore/payment.proto",
        "proto/bookstore/catalog.proto",
        "proto/bookstore/order.proto",
    ];

    for proto in &protos {
        println!("cargo:rerun-if-changed={proto}");
    }

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&protos, &["proto"])?;

    Ok(())
}
