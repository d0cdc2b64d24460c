//! Compiles the bus wire protocol.
//!
//! Uses `tonic-build` with the vendored `protoc` so builds do not depend on
//! a system protobuf compiler.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path().expect("vendored protoc"),
    );

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/bus.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/bus.proto");
    Ok(())
}
