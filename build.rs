//! Compiles the CSI v1 subset and the storage agent protocol.
//!
//! Generated code lands in `OUT_DIR` and is pulled in through
//! `tonic::include_proto!` in `src/lib.rs`. `protoc` is vendored so the
//! build does not depend on a system protobuf compiler.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    let well_known = protoc_bin_vendored::include_path()?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &["proto/csi.proto", "proto/storageagent.proto"],
            &[std::path::PathBuf::from("proto"), well_known],
        )?;

    println!("cargo:rerun-if-changed=proto/csi.proto");
    println!("cargo:rerun-if-changed=proto/storageagent.proto");

    Ok(())
}
