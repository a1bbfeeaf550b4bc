fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Mark build script to rerun if the proto file changes
    println!("cargo:rerun-if-changed=../.proto/fake_service.proto");

    // Use the vendored protoc so the build does not depend on a system install
    unsafe {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().map_err(|e| e.to_string())?);
    }

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["../.proto/fake_service.proto"], &["../.proto"])?;

    Ok(())
}
