fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Fall back to the bundled protoc when the host does not provide one.
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        // SAFETY: build scripts are single-threaded at this point.
        unsafe { std::env::set_var("PROTOC", protoc) };
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "proto/ssmgr/slave/v1/health.proto",
                "proto/ssmgr/slave/v1/slave.proto",
            ],
            &["proto"],
        )?;

    println!("cargo:rerun-if-changed=proto/ssmgr/slave/v1/health.proto");
    println!("cargo:rerun-if-changed=proto/ssmgr/slave/v1/slave.proto");
    println!("cargo:rerun-if-changed=proto");

    Ok(())
}
