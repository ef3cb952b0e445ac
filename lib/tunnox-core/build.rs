fn main() {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/bridge.proto"], &["proto"])
        .expect("failed to compile tunnox bridge proto");
}
