fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto");

    // Only the server side is needed, the runtime is the client.
    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .compile(&["proto/snapshots.proto"], &["proto"])?;

    Ok(())
}
