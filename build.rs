fn main() {
    let protos = ["src/proto/ferry.proto"];
    println!("cargo:rerun-if-changed=src/proto/ferry.proto");
    let mut prost_build = prost_build::Config::new();
    prost_build
        .compile_protos(&protos, &["src"])
        .expect("Protobufs in src are valid");
}
