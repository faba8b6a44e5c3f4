use super::{PackageVerifier, ServicePackage};
use crate::error::IntegrityError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use ota_registry::ServiceDescriptor;
use semver::Version;

/// Bytes covered by a package signature: `blake3(payload) || name || 0 || version`
#[must_use]
pub fn signing_message(name: &str, version: &Version, payload: &[u8]) -> Vec<u8> {
    let mut message = blake3::hash(payload).as_bytes().to_vec();
    message.extend_from_slice(name.as_bytes());
    message.push(0);
    message.extend_from_slice(version.to_string().as_bytes());
    message
}

fn check_identity(descriptor: &ServiceDescriptor, package: &ServicePackage) -> Result<(), IntegrityError> {
    if package.name != descriptor.name() || &package.version != descriptor.version() {
        return Err(IntegrityError(format!(
            "package is {}@{}, expected {}",
            package.name,
            package.version,
            descriptor.id()
        )));
    }
    if package.payload.is_empty() {
        return Err(IntegrityError(format!("empty payload for {}", descriptor.id())));
    }
    Ok(())
}

/// Requires a valid ed25519 signature from one trusted key
#[derive(Debug, Clone)]
pub struct Ed25519Verifier {
    trusted: VerifyingKey,
}

impl Ed25519Verifier {
    /// Trust `key`
    #[must_use]
    pub fn new(trusted: VerifyingKey) -> Self {
        Self { trusted }
    }

    /// Trust the hex-encoded public key
    ///
    /// # Errors
    /// Returns a description of what is wrong with the key.
    pub fn from_hex(key: &str) -> Result<Self, String> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(key.trim(), &mut bytes).map_err(|e| e.to_string())?;
        VerifyingKey::from_bytes(&bytes)
            .map(Self::new)
            .map_err(|e| e.to_string())
    }

    /// Sign a package the way this verifier expects
    #[must_use]
    pub fn sign(key: &SigningKey, name: &str, version: &Version, payload: &[u8]) -> Signature {
        key.sign(&signing_message(name, version, payload))
    }
}

#[async_trait::async_trait]
impl PackageVerifier for Ed25519Verifier {
    async fn verify(&self, descriptor: &ServiceDescriptor, package: &ServicePackage) -> Result<(), IntegrityError> {
        check_identity(descriptor, package)?;

        let raw = package
            .signature
            .as_deref()
            .ok_or_else(|| IntegrityError(format!("{} is unsigned", descriptor.id())))?;
        let signature = Signature::from_slice(raw).map_err(|e| IntegrityError(format!("malformed signature: {e}")))?;

        let message = signing_message(&package.name, &package.version, &package.payload);
        self.trusted.verify(&message, &signature).map_err(|_| {
            tracing::warn!(service = descriptor.name(), version = %descriptor.version(), "signature mismatch");
            IntegrityError(format!("signature mismatch for {}", descriptor.id()))
        })
    }
}

/// Integrity-only check: identity matches and the payload is non-empty
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestVerifier;

#[async_trait::async_trait]
impl PackageVerifier for DigestVerifier {
    async fn verify(&self, descriptor: &ServiceDescriptor, package: &ServicePackage) -> Result<(), IntegrityError> {
        check_identity(descriptor, package)
    }
}
