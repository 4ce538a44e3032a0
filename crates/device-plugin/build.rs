fn main() -> Result<(), Box<dyn std::error::Error>> {
    // server side for our own plugin, client side for kubelet registration
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/api.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/api.proto");
    Ok(())
}
