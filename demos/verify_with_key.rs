// Verify a cosign blob signature or sigstore bundle against a public key.
//
// To create test files:
// 1. Generate a key pair: `cosign generate-key-pair`
// 2. Sign an artifact: `cosign sign-blob --key cosign.key --bundle artifact.bundle artifact.txt`
// 3. Run: `cargo run --example verify_with_key -- artifact.txt artifact.bundle cosign.pub`

use sigstore_verdict::sources::file::FileSource;
use sigstore_verdict::{
    ArtifactRef, Collaborators, EnvOverrides, Result, SigstoreTufClient, Verifier, VerifyOptions,
};
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() != 4 {
        eprintln!("Usage: {} <artifact> <signature> <public_key>", args[0]);
        eprintln!("\nExample:");
        eprintln!("  {} artifact.txt artifact.bundle cosign.pub", args[0]);
        std::process::exit(1);
    }

    let artifact_path = Path::new(&args[1]);
    let signature_path = Path::new(&args[2]);
    let public_key_path = Path::new(&args[3]);

    println!("🔍 Verifying artifact: {:?}", artifact_path);
    println!("📝 Using signature: {:?}", signature_path);
    println!("🔑 With public key: {:?}", public_key_path);
    println!();

    let options = VerifyOptions::default()
        .with_key(public_key_path)
        .with_env(EnvOverrides::from_env())
        .with_timeout(Duration::from_secs(60));
    let collaborators = Collaborators::new(
        Arc::new(FileSource::new(signature_path)),
        Arc::new(SigstoreTufClient::new()),
    );
    let verifier = Verifier::new(options, collaborators).await?;
    let verdict = verifier
        .verify_artifact(&ArtifactRef::from_path(artifact_path)?)
        .await?;

    for record in &verdict.verified_records {
        match &record.log_entry {
            Some(entry) => println!(
                "✅ Record {} verified, logged at index {} ({:?})",
                record.index, entry.entry.log_index, entry.mode
            ),
            None => println!("✅ Record {} verified", record.index),
        }
    }
    for failure in &verdict.record_errors {
        println!("⚠️  Record {} rejected: {}", failure.index, failure.error);
    }

    match verdict.failure() {
        None => println!("✅ Verification successful!"),
        Some(e) => {
            println!("❌ Verification failed: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
