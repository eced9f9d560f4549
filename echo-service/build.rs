use prost::Message;
use std::env::var;
use std::fs;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // List of proto files containing a service definition
    let proto_files = &[
        // Services
        "echo.proto",
        "user/v1/user.proto",
    ];

    // Name of the folder containing the proto definitions
    let proto_folder = "proto";
    let out_dir = PathBuf::from(var("OUT_DIR").expect("Missing OUT_DIR environment variable"));

    // google/api/*.proto ship with switchyard-core
    let googleapis = "../switchyard-core/proto";
    let mut compiler = protox::Compiler::new([proto_folder, googleapis])?;
    compiler.include_imports(true).include_source_info(false);
    compiler.open_files(proto_files)?;

    let descriptors = compiler.file_descriptor_set().encode_to_vec();
    fs::write(out_dir.join("descriptors.bin"), descriptors)?;

    println!("cargo:rerun-if-changed={proto_folder}");
    println!("cargo:rerun-if-changed={googleapis}");

    Ok(())
}
