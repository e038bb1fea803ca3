fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc);

    let out_dir = std::path::PathBuf::from(std::env::var("OUT_DIR")?);

    let protos = [
        "../../proto/server/database.proto",
        "../../proto/server/kvstore.proto",
        "../../proto/server/session.proto",
        "../../proto/server/transactions.proto",
        "../../proto/server/shard.proto",
        "../../proto/server/host.proto",
        "../../proto/server/transport.proto",
    ];
    for proto in &protos {
        println!("cargo:rerun-if-changed={proto}");
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("descriptor.bin"))
        .compile_protos(&protos, &["../../proto"])?;
    Ok(())
}
