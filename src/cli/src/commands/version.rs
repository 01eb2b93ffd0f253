//! `imgcrypt version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("imgcrypt version {}", imgcrypt_core::VERSION);
    println!(
        "stream format 0x{:02x}, key wrapping {}",
        imgcrypt_runtime::crypto::stream::STREAM_VERSION,
        imgcrypt_runtime::Algorithm::default()
    );
    Ok(())
}
