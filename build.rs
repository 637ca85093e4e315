fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(feature = "server")]
    tonic_build::compile_protos("src/proto/iso_psf.proto")?;
    Ok(())
}
