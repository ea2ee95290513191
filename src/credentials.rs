//! Credential generation
//!
//! Issues TLS client certificates signed by the clients CA and random SCRAM
//! passwords, and decides when material already stored in a user's secret can
//! be reused instead of being issued again.

use crate::error::{OperatorError, Result};
use crate::retry::{RetryPolicy, Step};
use crate::secrets::SecretStore;
use crate::validation::AuthenticationMode;
use chrono::{Datelike, Duration as ChronoDuration, Utc};
use k8s_openapi::ByteString;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::ParsedExtension;
use x509_parser::pem::parse_x509_pem;

// Secret data keys
pub const CA_CERT_KEY: &str = "ca.crt";
pub const CA_KEY_KEY: &str = "ca.key";
pub const USER_CERT_KEY: &str = "user.crt";
pub const USER_KEY_KEY: &str = "user.key";
pub const PASSWORD_KEY: &str = "password";
pub const SASL_JAAS_CONFIG_KEY: &str = "sasl.jaas.config";

/// Shortest password the generator will issue
pub const MIN_PASSWORD_LENGTH: usize = 12;

/// What to do with a SCRAM password that is already stored in the user secret
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PasswordPolicy {
    /// Keep the stored password
    #[default]
    Reuse,
    /// Issue a new password on every pass
    Regenerate,
}

/// Settings of the credential generator
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub tls_validity_days: u32,
    /// Certificates expiring within this window are renewed
    pub tls_renewal_days: u32,
    pub password_length: usize,
    pub password_policy: PasswordPolicy,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            tls_validity_days: 365,
            tls_renewal_days: 30,
            password_length: 32,
            password_policy: PasswordPolicy::Reuse,
        }
    }
}

/// Location of the clients CA secrets
#[derive(Debug, Clone)]
pub struct CaConfig {
    pub namespace: String,
    /// Secret holding the CA certificate under `ca.crt`
    pub cert_secret: String,
    /// Secret holding the CA private key under `ca.key`
    pub key_secret: String,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            cert_secret: "streamline-clients-ca-cert".to_string(),
            key_secret: "streamline-clients-ca".to_string(),
        }
    }
}

/// Generated authentication material for one user
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Tls {
        ca_cert: String,
        user_cert: String,
        user_key: String,
    },
    Scram {
        password: String,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Tls { user_cert, .. } => f
                .debug_struct("Tls")
                .field("user_cert_len", &user_cert.len())
                .field("user_key", &"[REDACTED]")
                .finish(),
            Credential::Scram { .. } => f
                .debug_struct("Scram")
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

impl Credential {
    /// Secret data for the credential; `username` goes into the JAAS config.
    pub fn to_secret_data(&self, username: &str) -> BTreeMap<String, ByteString> {
        let entries: Vec<(&str, String)> = match self {
            Credential::Tls {
                ca_cert,
                user_cert,
                user_key,
            } => vec![
                (CA_CERT_KEY, ca_cert.clone()),
                (USER_CERT_KEY, user_cert.clone()),
                (USER_KEY_KEY, user_key.clone()),
            ],
            Credential::Scram { password } => vec![
                (PASSWORD_KEY, password.clone()),
                (
                    SASL_JAAS_CONFIG_KEY,
                    format!(
                        "org.apache.kafka.common.security.scram.ScramLoginModule required username=\"{}\" password=\"{}\";",
                        username, password
                    ),
                ),
            ],
        };
        entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), ByteString(value.into_bytes())))
            .collect()
    }

    /// Read a credential back from secret data; TLS wins when all three keys exist.
    pub fn from_secret_data(data: &BTreeMap<String, ByteString>) -> Option<Self> {
        let text = |key: &str| {
            data.get(key)
                .and_then(|value| String::from_utf8(value.0.clone()).ok())
                .filter(|value| !value.is_empty())
        };

        if let (Some(ca_cert), Some(user_cert), Some(user_key)) =
            (text(CA_CERT_KEY), text(USER_CERT_KEY), text(USER_KEY_KEY))
        {
            return Some(Credential::Tls {
                ca_cert,
                user_cert,
                user_key,
            });
        }
        text(PASSWORD_KEY).map(|password| Credential::Scram { password })
    }
}

/// The CA that signs user certificates
pub struct ClientsCa {
    cert_pem: String,
    issuer: rcgen::Certificate,
    key: KeyPair,
    /// The CA certificate carries a subject key identifier
    has_key_identifier: bool,
}

impl fmt::Debug for ClientsCa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientsCa")
            .field("cert_pem_len", &self.cert_pem.len())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

fn fatal(message: impl Into<String>) -> OperatorError {
    OperatorError::credential_generation(message, false)
}

fn parse_certificate<T>(pem: &str, inspect: impl FnOnce(&X509Certificate<'_>) -> T) -> Result<T> {
    let (_, pem) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| fatal(format!("Failed to parse certificate PEM: {:?}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| fatal(format!("Failed to parse X.509 certificate: {:?}", e)))?;
    Ok(inspect(&cert))
}

fn subject_key_identifier(cert: &X509Certificate<'_>) -> Option<Vec<u8>> {
    cert.extensions()
        .iter()
        .find_map(|ext| match ext.parsed_extension() {
            ParsedExtension::SubjectKeyIdentifier(id) => Some(id.0.to_vec()),
            _ => None,
        })
}

/// Issuer params carrying the CA subject and key identifier, used to sign with rcgen.
///
/// The key identifier is taken from the certificate as is, so the authority key
/// identifier of issued certificates matches the CA's subject key identifier.
fn issuer_params(cert: &X509Certificate<'_>) -> CertificateParams {
    let mut params = CertificateParams::default();
    if let Some(ski) = subject_key_identifier(cert) {
        params.key_identifier_method = KeyIdMethod::PreSpecified(ski);
    }
    let mut dn = DistinguishedName::new();
    for rdn in cert.subject().iter() {
        for attr in rdn.iter() {
            let Ok(value) = attr.as_str() else { continue };
            match attr.attr_type().to_id_string().as_str() {
                "2.5.4.3" => dn.push(DnType::CommonName, value),
                "2.5.4.6" => dn.push(DnType::CountryName, value),
                "2.5.4.7" => dn.push(DnType::LocalityName, value),
                "2.5.4.8" => dn.push(DnType::StateOrProvinceName, value),
                "2.5.4.10" => dn.push(DnType::OrganizationName, value),
                "2.5.4.11" => dn.push(DnType::OrganizationalUnitName, value),
                _ => {}
            }
        }
    }
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

impl ClientsCa {
    /// Load the CA from PEM; the key must belong to the certificate.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| fatal(format!("Failed to parse clients CA private key: {}", e)))?;

        let (params, has_key_identifier, public_key) = parse_certificate(cert_pem, |cert| {
            (
                issuer_params(cert),
                subject_key_identifier(cert).is_some(),
                cert.public_key().subject_public_key.data.to_vec(),
            )
        })?;
        if public_key != key.public_key_raw() {
            return Err(fatal(
                "Clients CA private key does not match the CA certificate",
            ));
        }

        let issuer = params
            .self_signed(&key)
            .map_err(|e| fatal(format!("Failed to prepare clients CA for signing: {}", e)))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            issuer,
            key,
            has_key_identifier,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }
}

/// Read the clients CA from its two secrets.
///
/// An unreachable store is transient; a missing or broken CA is not.
pub async fn load_clients_ca(
    store: &dyn SecretStore,
    config: &CaConfig,
    retry: &RetryPolicy,
) -> Result<ClientsCa> {
    let cert_pem = read_ca_entry(store, config, &config.cert_secret, CA_CERT_KEY, retry).await?;
    let key_pem = read_ca_entry(store, config, &config.key_secret, CA_KEY_KEY, retry).await?;
    ClientsCa::from_pem(&cert_pem, &key_pem)
}

async fn read_ca_entry(
    store: &dyn SecretStore,
    config: &CaConfig,
    secret_name: &str,
    key: &str,
    retry: &RetryPolicy,
) -> Result<String> {
    let namespace = config.namespace.as_str();
    let secret = retry
        .run(Step::CredentialGeneration, "get_clients_ca", || {
            store.get(namespace, secret_name)
        })
        .await
        .map_err(|e| {
            OperatorError::credential_generation(
                format!("Clients CA secret {}/{} unavailable: {}", namespace, secret_name, e),
                e.is_retryable(),
            )
        })?
        .ok_or_else(|| {
            fatal(format!(
                "Clients CA secret {}/{} does not exist",
                namespace, secret_name
            ))
        })?;

    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|value| String::from_utf8(value.0.clone()).ok())
        .ok_or_else(|| {
            fatal(format!(
                "Clients CA secret {}/{} has no {} entry",
                namespace, secret_name, key
            ))
        })
}

/// A credential together with where it came from
#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub credential: Credential,
    /// True when the stored credential was kept as is
    pub reused: bool,
}

/// Issues credentials and decides when stored ones are still good.
#[derive(Debug, Clone, Default)]
pub struct CredentialGenerator {
    config: CredentialConfig,
}

impl CredentialGenerator {
    pub fn new(config: CredentialConfig) -> Self {
        Self { config }
    }

    /// Issue fresh material for `name` in `mode`.
    ///
    /// Returns `None` for modes without operator-managed credentials.
    pub fn generate(
        &self,
        name: &str,
        mode: &AuthenticationMode,
        ca: Option<&ClientsCa>,
    ) -> Result<Option<Credential>> {
        match mode {
            AuthenticationMode::Tls => {
                let ca = ca.ok_or_else(|| fatal("TLS authentication requires the clients CA"))?;
                self.generate_tls(name, ca).map(Some)
            }
            AuthenticationMode::ScramSha512 { .. } => Ok(Some(Credential::Scram {
                password: generate_password(self.config.password_length),
            })),
            AuthenticationMode::TlsExternal | AuthenticationMode::None => Ok(None),
        }
    }

    /// Reuse `existing` when still valid, otherwise issue new material.
    ///
    /// `provided_password` is a password the user supplied for SCRAM and always wins.
    pub fn resolve(
        &self,
        name: &str,
        mode: &AuthenticationMode,
        ca: Option<&ClientsCa>,
        existing: Option<&Credential>,
        provided_password: Option<String>,
    ) -> Result<Option<ResolvedCredential>> {
        match (mode, existing) {
            (AuthenticationMode::ScramSha512 { .. }, _) if provided_password.is_some() => {
                let credential = Credential::Scram {
                    password: provided_password.unwrap_or_default(),
                };
                let reused = existing == Some(&credential);
                Ok(Some(ResolvedCredential { credential, reused }))
            }
            (AuthenticationMode::ScramSha512 { .. }, Some(stored @ Credential::Scram { .. }))
                if self.config.password_policy == PasswordPolicy::Reuse =>
            {
                Ok(Some(ResolvedCredential {
                    credential: stored.clone(),
                    reused: true,
                }))
            }
            (AuthenticationMode::Tls, Some(stored @ Credential::Tls { .. }))
                if ca.is_some_and(|ca| self.tls_reusable(name, stored, ca)) =>
            {
                Ok(Some(ResolvedCredential {
                    credential: stored.clone(),
                    reused: true,
                }))
            }
            _ => Ok(self
                .generate(name, mode, ca)?
                .map(|credential| ResolvedCredential {
                    credential,
                    reused: false,
                })),
        }
    }

    fn tls_reusable(&self, name: &str, stored: &Credential, ca: &ClientsCa) -> bool {
        let Credential::Tls {
            ca_cert, user_cert, ..
        } = stored
        else {
            return false;
        };
        if ca_cert.trim() != ca.cert_pem().trim() {
            debug!(user = name, "Clients CA changed, renewing certificate");
            return false;
        }

        let renew_before =
            Utc::now().timestamp() + i64::from(self.config.tls_renewal_days) * 86_400;
        let inspected = parse_certificate(user_cert, |cert| {
            let common_name = cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_string);
            (common_name, cert.validity().not_after.timestamp())
        });

        match inspected {
            Ok((Some(common_name), not_after)) if common_name == name => {
                if not_after <= renew_before {
                    info!(user = name, "Certificate expires soon, renewing");
                    false
                } else {
                    true
                }
            }
            _ => false,
        }
    }

    fn generate_tls(&self, name: &str, ca: &ClientsCa) -> Result<Credential> {
        let user_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| fatal(format!("Failed to generate key pair: {}", e)))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        // Without a CA key identifier there is nothing for chain building to match
        params.use_authority_key_identifier_extension = ca.has_key_identifier;

        let now = Utc::now();
        let not_after = now + ChronoDuration::days(i64::from(self.config.tls_validity_days));
        params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
        params.not_after = rcgen::date_time_ymd(
            not_after.year(),
            not_after.month() as u8,
            not_after.day() as u8,
        );

        // Random positive 128-bit serial
        let mut serial = [0u8; 16];
        OsRng.fill_bytes(&mut serial);
        serial[0] &= 0x7f;
        serial[0] |= 0x01;
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let cert = params
            .signed_by(&user_key, &ca.issuer, &ca.key)
            .map_err(|e| fatal(format!("Failed to sign user certificate: {}", e)))?;

        info!(user = name, "Issued user certificate");
        Ok(Credential::Tls {
            ca_cert: ca.cert_pem.clone(),
            user_cert: cert.pem(),
            user_key: user_key.serialize_pem(),
        })
    }
}

/// Random alphanumeric password from the OS RNG, at least [`MIN_PASSWORD_LENGTH`] long.
pub fn generate_password(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length.max(MIN_PASSWORD_LENGTH))
        .map(char::from)
        .collect()
}
