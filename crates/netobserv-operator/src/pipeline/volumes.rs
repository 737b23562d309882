//! Volumes and mounts required by the generated pipeline configuration
//!
//! Every certificate or credential file referenced from the pipeline is
//! mounted from its Secret or ConfigMap under `/var/<volume>`.

use crate::crd::{CertificateReference, ClientTls, FileReference, MountableType};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, ProjectedVolumeSource, SecretVolumeSource,
    ServiceAccountTokenProjection, Volume, VolumeMount, VolumeProjection,
};

/// Directory of projected service account tokens
pub const TOKENS_PATH: &str = "/var/run/secrets/tokens/";

/// Paths of a mounted certificate pair
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertPaths {
    pub cert: Option<String>,
    pub key: Option<String>,
}

/// Paths of mounted TLS material for a client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientCertPaths {
    pub ca: Option<String>,
    pub user_cert: Option<String>,
    pub user_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct VolumeInfo {
    volume: Volume,
    mount: VolumeMount,
}

/// Accumulates volumes while a pipeline is compiled
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Volumes {
    info: Vec<VolumeInfo>,
}

impl Volumes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount the CA and, when set, the user certificate of a client TLS config
    pub fn add_mutual_tls(&mut self, tls: &ClientTls, prefix: &str) -> ClientCertPaths {
        let ca = self.add_certificate(&tls.ca_cert, &format!("{}-ca", prefix));
        let user = self.add_certificate(&tls.user_cert, &format!("{}-user", prefix));
        ClientCertPaths {
            ca: ca.cert,
            user_cert: user.cert,
            user_key: user.key,
        }
    }

    /// Mount only the CA of a client TLS config
    pub fn add_ca_certificate(&mut self, tls: &ClientTls, prefix: &str) -> Option<String> {
        self.add_certificate(&tls.ca_cert, &format!("{}-ca", prefix))
            .cert
    }

    /// Mount a certificate reference; unnamed references are skipped
    pub fn add_certificate(&mut self, cert: &CertificateReference, volume_name: &str) -> CertPaths {
        if cert.name.is_empty() {
            return CertPaths::default();
        }
        self.insert_or_replace(build_volume_and_mount(cert.ref_type, &cert.name, volume_name));
        CertPaths {
            cert: Some(format!("/var/{}/{}", volume_name, cert.cert_file)),
            key: (!cert.cert_key.is_empty())
                .then(|| format!("/var/{}/{}", volume_name, cert.cert_key)),
        }
    }

    /// Mount a single-file reference and return the file path
    pub fn add_file(&mut self, file: &FileReference, volume_name: &str) -> String {
        self.insert_or_replace(build_volume_and_mount(file.ref_type, &file.name, volume_name));
        format!("/var/{}/{}", volume_name, file.file)
    }

    /// Mount a projected service account token and return its path
    pub fn add_token(&mut self, name: &str) -> String {
        let path = format!("{}{}", TOKENS_PATH, name);
        if self.info.iter().any(|i| i.volume.name == name) {
            return path;
        }
        let volume = Volume {
            name: name.to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![VolumeProjection {
                    service_account_token: Some(ServiceAccountTokenProjection {
                        path: name.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mount = VolumeMount {
            name: name.to_string(),
            mount_path: TOKENS_PATH.to_string(),
            ..Default::default()
        };
        self.info.push(VolumeInfo { volume, mount });
        path
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.info.iter().map(|i| i.volume.clone()).collect()
    }

    pub fn mounts(&self) -> Vec<VolumeMount> {
        self.info.iter().map(|i| i.mount.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
    }

    fn insert_or_replace(&mut self, vi: VolumeInfo) {
        match self
            .info
            .iter_mut()
            .find(|i| i.volume.name == vi.volume.name || i.mount.name == vi.mount.name)
        {
            Some(existing) => *existing = vi,
            None => self.info.push(vi),
        }
    }
}

fn build_volume_and_mount(ref_type: MountableType, ref_name: &str, volume_name: &str) -> VolumeInfo {
    let mut volume = Volume {
        name: volume_name.to_string(),
        ..Default::default()
    };
    match ref_type {
        MountableType::ConfigMap => {
            volume.config_map = Some(ConfigMapVolumeSource {
                name: ref_name.to_string(),
                ..Default::default()
            });
        }
        MountableType::Secret => {
            volume.secret = Some(SecretVolumeSource {
                secret_name: Some(ref_name.to_string()),
                ..Default::default()
            });
        }
    }
    VolumeInfo {
        volume,
        mount: VolumeMount {
            name: volume_name.to_string(),
            read_only: Some(true),
            mount_path: format!("/var/{}", volume_name),
            ..Default::default()
        },
    }
}
