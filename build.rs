fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only rerun if proto files change
    println!("cargo:rerun-if-changed=proto/eventbus/v1/pubsub.proto");

    // Server stubs are generated for the in-process test server.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .bytes(["."])
        .compile_protos(&["proto/eventbus/v1/pubsub.proto"], &["proto"])?;
    Ok(())
}
