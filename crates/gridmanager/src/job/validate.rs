use std::path::PathBuf;

use crate::common::config::GridManagerConfig;
use crate::job::driver::{BackendDriver, create_driver};
use crate::job::grid_id::{GridJobId, GridResource};
use crate::proxy::Proxy;
use crate::queue::JobAttributes;
use crate::queue::attrs::*;
use crate::resource::ResourceKey;

/// Everything a job needs to be constructed, checked up front.
pub struct JobSetup {
    pub driver: Box<dyn BackendDriver>,
    pub grid_resource: GridResource,
    pub key: ResourceKey,
    pub proxy: Option<Proxy>,
    pub grid_job_id: Option<GridJobId>,
}

/// Outcome of validating a job record.
pub enum JobInstance {
    Valid(JobSetup),
    /// The job is created directly on hold with this reason.
    Rejected { reason: String },
}

impl JobInstance {
    pub fn new(attrs: &JobAttributes, config: &GridManagerConfig) -> Self {
        match validate_job(attrs, config) {
            Ok(setup) => JobInstance::Valid(setup),
            Err(reason) => JobInstance::Rejected { reason },
        }
    }
}

fn string_attr<'a>(attrs: &'a JobAttributes, name: &str) -> Option<&'a str> {
    attrs.get(name).and_then(|v| v.as_str()).filter(|v| !v.is_empty())
}

fn parse_proxy(attrs: &JobAttributes) -> Result<Option<Proxy>, String> {
    let Some(path) = string_attr(attrs, X509_USER_PROXY) else {
        return Ok(None);
    };
    let subject = string_attr(attrs, X509_USER_PROXY_SUBJECT)
        .ok_or_else(|| format!("Job has a credential but {X509_USER_PROXY_SUBJECT} is undefined"))?;
    let expiration = attrs
        .get(X509_USER_PROXY_EXPIRATION)
        .and_then(|v| v.as_int())
        .ok_or_else(|| {
            format!("Job has a credential but {X509_USER_PROXY_EXPIRATION} is undefined")
        })?;
    Ok(Some(Proxy {
        path: PathBuf::from(path),
        subject: subject.to_string(),
        expiration,
    }))
}

/// Checks the grid attributes of a job record.
pub fn validate_job(
    attrs: &JobAttributes,
    config: &GridManagerConfig,
) -> Result<JobSetup, String> {
    let resource_text = string_attr(attrs, GRID_RESOURCE)
        .ok_or_else(|| format!("{GRID_RESOURCE} is not set in the job ad"))?;
    let grid_resource = GridResource::parse(resource_text)?;
    let driver = create_driver(&grid_resource.kind)
        .ok_or_else(|| format!("Unknown grid type {:?}", grid_resource.kind))?;

    let proxy = parse_proxy(attrs)?;
    let credential = grid_resource
        .extra
        .first()
        .cloned()
        .or_else(|| proxy.as_ref().map(|p| p.subject.clone()))
        .ok_or_else(|| format!("No credential given for {}", grid_resource.endpoint))?;

    if driver.needs_staging() && config.staging_url_base.is_none() && proxy.is_none() {
        return Err("Staging the sandbox requires a credential".to_string());
    }

    let grid_job_id = match string_attr(attrs, GRID_JOB_ID) {
        Some(text) => {
            let id = GridJobId::parse(text)?;
            if id.kind != grid_resource.kind || id.endpoint != grid_resource.endpoint {
                return Err(format!(
                    "{GRID_JOB_ID} {text:?} does not match {GRID_RESOURCE} {resource_text:?}"
                ));
            }
            Some(id)
        }
        None => None,
    };

    Ok(JobSetup {
        key: ResourceKey::new(&grid_resource.endpoint, &credential),
        driver,
        grid_resource,
        proxy,
        grid_job_id,
    })
}

#[cfg(test)]
mod tests {
    use super::{JobInstance, validate_job};
    use crate::common::config::GridManagerConfig;
    use crate::queue::JobAttributes;
    use crate::queue::attrs::*;

    fn attrs(pairs: &[(&str, &str)]) -> JobAttributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), (*v).into()))
            .collect()
    }

    #[test]
    fn test_valid_cloud_job() {
        let attrs = attrs(&[
            (GRID_RESOURCE, "ec2 https://ec2.example.com AKIA"),
            (GRID_JOB_ID, "ec2 https://ec2.example.com gm-1 i-7"),
        ]);
        let setup = validate_job(&attrs, &GridManagerConfig::default()).unwrap();
        assert_eq!(setup.driver.kind(), "ec2");
        assert_eq!(setup.key.credential, "AKIA");
        assert_eq!(setup.grid_job_id.unwrap().handle.as_deref(), Some("i-7"));
    }

    #[test]
    fn test_rejections() {
        let config = GridManagerConfig::default();
        let reject = |attrs: JobAttributes| match JobInstance::new(&attrs, &config) {
            JobInstance::Rejected { reason } => reason,
            JobInstance::Valid(_) => panic!("job should be rejected"),
        };
        assert!(reject(attrs(&[])).contains(GRID_RESOURCE));
        assert!(reject(attrs(&[(GRID_RESOURCE, "condor host")])).contains("Unknown grid type"));
        assert!(reject(attrs(&[(GRID_RESOURCE, "gce https://gce")])).contains("No credential"));
        assert!(
            reject(attrs(&[
                (GRID_RESOURCE, "gce https://gce key"),
                (GRID_JOB_ID, "gce https://other gm-1")
            ]))
            .contains("does not match")
        );
        assert!(
            reject(attrs(&[
                (GRID_RESOURCE, "batch https://ce"),
                (X509_USER_PROXY, "/tmp/x509up")
            ]))
            .contains(X509_USER_PROXY_SUBJECT)
        );
    }

    #[test]
    fn test_batch_job_uses_proxy_subject() {
        let mut attrs = attrs(&[
            (GRID_RESOURCE, "batch https://ce"),
            (X509_USER_PROXY, "/tmp/x509up"),
            (X509_USER_PROXY_SUBJECT, "/CN=alice"),
        ]);
        attrs.insert(X509_USER_PROXY_EXPIRATION.to_string(), 1000i64.into());
        let setup = validate_job(&attrs, &GridManagerConfig::default()).unwrap();
        assert_eq!(setup.key.credential, "/CN=alice");
        assert_eq!(setup.proxy.unwrap().expiration, 1000);
    }
}
