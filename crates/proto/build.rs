// SPDX-License-Identifier: Apache-2.0

//! A build script to generate the HEYP gRPC API (client and server stubs).

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The gRPC stubs are vendored in `src/heyp.v1.rs` to avoid depending on
    // protoc at build time.
    //
    // To regenerate the gRPC API from the proto file:
    // - Uncomment the following lines.
    // - Run `cargo build` to regenerate the API.
    // - Comment the following lines.
    // - Commit the changes.
    // tonic_build::configure()
    //     .out_dir("src")
    //     .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
    //     .type_attribute(".", "#[serde(default)]")
    //     .compile_protos(&["proto/heyp/v1/heyp.proto"], &["proto"])?;
    Ok(())
}
