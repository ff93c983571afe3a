use crate::gahp::GahpRequest;
use crate::resource::ResourceKey;

/// The operation may have partially succeeded; verify before trying again.
pub const NEEDS_CHECK_ERROR_CODE: &str = "NEEDS_CHECK";
/// The endpoint temporarily refuses new work.
pub const OVER_CAPACITY_ERROR_CODE: &str = "OVER_CAPACITY";
pub const NOT_FOUND_ERROR_CODE: &str = "NOT_FOUND";

/// Everything a submit request is built from.
#[derive(Debug, Clone)]
pub struct SubmitParams<'a> {
    pub target: &'a ResourceKey,
    pub submit_key: &'a str,
    pub keypair: Option<&'a str>,
    pub staging_url: Option<&'a str>,
    /// Job attributes forwarded to the backend, sorted by name.
    pub attributes: Vec<(String, String)>,
}

/// Remote operations of one kind of backend. Every request must be built only from its
/// arguments, so that a retried call is recognized as the same call.
///
/// Replies follow one convention: a submit or lookup returns the remote handle as its
/// first value (a lookup that found nothing returns no value), a status query returns
/// the remote status.
pub trait BackendDriver {
    /// Grid type as written in `GridResource`.
    fn kind(&self) -> &'static str;

    /// Names of job attributes sent along with the submit request.
    fn submit_attributes(&self) -> &'static [&'static str];

    fn submit_request(&self, params: &SubmitParams) -> GahpRequest;
    fn status_request(&self, target: &ResourceKey, handle: &str) -> GahpRequest;
    fn cancel_request(&self, target: &ResourceKey, handle: &str) -> GahpRequest;
    /// Finds the remote job created with `submit_key`.
    fn lookup_request(&self, target: &ResourceKey, submit_key: &str) -> GahpRequest;

    fn keypair_name(&self, _submit_key: &str) -> Option<String> {
        None
    }

    fn create_keypair_request(&self, _target: &ResourceKey, _keypair: &str) -> Option<GahpRequest> {
        None
    }

    fn destroy_keypair_request(
        &self,
        _target: &ResourceKey,
        _keypair: &str,
    ) -> Option<GahpRequest> {
        None
    }

    /// Statuses meaning that the job has started on the remote side.
    fn is_running_status(&self, status: &str) -> bool;
    fn is_terminated_status(&self, status: &str) -> bool;

    /// The backend fetches the sandbox from a staging server.
    fn needs_staging(&self) -> bool {
        false
    }

    /// Fresh key that makes the submission idempotent on the remote side.
    fn new_submit_key(&self) -> String {
        let bytes: [u8; 16] = rand::random();
        format!("gm-{}", hex::encode(bytes))
    }
}

fn request(command: &str, target: &ResourceKey, args: &[&str]) -> GahpRequest {
    GahpRequest::new(
        command,
        [target.endpoint.as_str(), target.credential.as_str()]
            .into_iter()
            .chain(args.iter().copied()),
    )
}

fn submit_args(params: &SubmitParams, extra: &[(&str, Option<&str>)]) -> Vec<String> {
    let mut args = vec![
        params.target.endpoint.clone(),
        params.target.credential.clone(),
        params.submit_key.to_string(),
    ];
    for (name, value) in extra {
        if let Some(value) = value {
            args.push(format!("{name}={value}"));
        }
    }
    args.extend(
        params
            .attributes
            .iter()
            .map(|(name, value)| format!("{name}={value}")),
    );
    args
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudProvider {
    Gce,
    Ec2,
    Azure,
}

struct CloudCommands {
    submit: &'static str,
    status: &'static str,
    cancel: &'static str,
    lookup: &'static str,
}

/// Virtual machines of a cloud provider.
pub struct CloudDriver {
    provider: CloudProvider,
}

impl CloudDriver {
    pub fn new(provider: CloudProvider) -> Self {
        Self { provider }
    }

    fn commands(&self) -> CloudCommands {
        match self.provider {
            CloudProvider::Gce => CloudCommands {
                submit: "GCE_INSTANCE_INSERT",
                status: "GCE_INSTANCE_STATUS",
                cancel: "GCE_INSTANCE_DELETE",
                lookup: "GCE_INSTANCE_LOOKUP",
            },
            CloudProvider::Ec2 => CloudCommands {
                submit: "EC2_VM_START",
                status: "EC2_VM_STATUS",
                cancel: "EC2_VM_STOP",
                lookup: "EC2_VM_LOOKUP",
            },
            CloudProvider::Azure => CloudCommands {
                submit: "AZURE_VM_CREATE",
                status: "AZURE_VM_INFO",
                cancel: "AZURE_VM_DELETE",
                lookup: "AZURE_VM_LOOKUP",
            },
        }
    }
}

impl BackendDriver for CloudDriver {
    fn kind(&self) -> &'static str {
        match self.provider {
            CloudProvider::Gce => "gce",
            CloudProvider::Ec2 => "ec2",
            CloudProvider::Azure => "azure",
        }
    }

    fn submit_attributes(&self) -> &'static [&'static str] {
        match self.provider {
            CloudProvider::Gce => &["GceImage", "GceMachineType", "GceMetadata"],
            CloudProvider::Ec2 => &["Ec2AmiId", "Ec2InstanceType", "Ec2UserData"],
            CloudProvider::Azure => &["AzureImage", "AzureSize", "AzureLocation"],
        }
    }

    fn submit_request(&self, params: &SubmitParams) -> GahpRequest {
        GahpRequest::new(
            self.commands().submit,
            submit_args(params, &[("keypair", params.keypair)]),
        )
    }

    fn status_request(&self, target: &ResourceKey, handle: &str) -> GahpRequest {
        request(self.commands().status, target, &[handle])
    }

    fn cancel_request(&self, target: &ResourceKey, handle: &str) -> GahpRequest {
        request(self.commands().cancel, target, &[handle])
    }

    fn lookup_request(&self, target: &ResourceKey, submit_key: &str) -> GahpRequest {
        request(self.commands().lookup, target, &[submit_key])
    }

    fn keypair_name(&self, submit_key: &str) -> Option<String> {
        (self.provider == CloudProvider::Ec2).then(|| format!("{submit_key}-key"))
    }

    fn create_keypair_request(&self, target: &ResourceKey, keypair: &str) -> Option<GahpRequest> {
        (self.provider == CloudProvider::Ec2)
            .then(|| request("EC2_KEYPAIR_CREATE", target, &[keypair]))
    }

    fn destroy_keypair_request(&self, target: &ResourceKey, keypair: &str) -> Option<GahpRequest> {
        (self.provider == CloudProvider::Ec2)
            .then(|| request("EC2_KEYPAIR_DESTROY", target, &[keypair]))
    }

    fn is_running_status(&self, status: &str) -> bool {
        match self.provider {
            CloudProvider::Gce => matches!(status, "RUNNING" | "STOPPING" | "STOPPED" | "TERMINATED"),
            CloudProvider::Ec2 => matches!(
                status,
                "running" | "shutting-down" | "stopping" | "stopped" | "terminated"
            ),
            CloudProvider::Azure => matches!(status, "running" | "stopped" | "deallocated"),
        }
    }

    fn is_terminated_status(&self, status: &str) -> bool {
        match self.provider {
            CloudProvider::Gce => status == "TERMINATED",
            CloudProvider::Ec2 => matches!(status, "terminated" | "stopped"),
            CloudProvider::Azure => matches!(status, "stopped" | "deallocated"),
        }
    }
}

/// Batch jobs handed to a remote compute element; the sandbox is fetched from a
/// staging server.
pub struct BatchDriver;

impl BackendDriver for BatchDriver {
    fn kind(&self) -> &'static str {
        "batch"
    }

    fn submit_attributes(&self) -> &'static [&'static str] {
        &["Cmd", "Arguments", "Queue", "TransferInput"]
    }

    fn submit_request(&self, params: &SubmitParams) -> GahpRequest {
        GahpRequest::new(
            "BATCH_JOB_SUBMIT",
            submit_args(params, &[("staging_url", params.staging_url)]),
        )
    }

    fn status_request(&self, target: &ResourceKey, handle: &str) -> GahpRequest {
        request("BATCH_JOB_STATUS", target, &[handle])
    }

    fn cancel_request(&self, target: &ResourceKey, handle: &str) -> GahpRequest {
        request("BATCH_JOB_CANCEL", target, &[handle])
    }

    fn lookup_request(&self, target: &ResourceKey, submit_key: &str) -> GahpRequest {
        request("BATCH_JOB_LOOKUP", target, &[submit_key])
    }

    fn is_running_status(&self, status: &str) -> bool {
        matches!(status, "RUNNING" | "COMPLETED" | "FAILED")
    }

    fn is_terminated_status(&self, status: &str) -> bool {
        matches!(status, "COMPLETED" | "FAILED")
    }

    fn needs_staging(&self) -> bool {
        true
    }
}

pub fn create_driver(kind: &str) -> Option<Box<dyn BackendDriver>> {
    let driver: Box<dyn BackendDriver> = match kind.to_ascii_lowercase().as_str() {
        "gce" => Box::new(CloudDriver::new(CloudProvider::Gce)),
        "ec2" => Box::new(CloudDriver::new(CloudProvider::Ec2)),
        "azure" => Box::new(CloudDriver::new(CloudProvider::Azure)),
        "batch" => Box::new(BatchDriver),
        _ => return None,
    };
    Some(driver)
}

#[cfg(test)]
mod tests {
    use super::{BackendDriver, SubmitParams, create_driver};
    use crate::resource::ResourceKey;

    #[test]
    fn test_submit_request_is_deterministic() {
        let driver = create_driver("ec2").unwrap();
        let target = ResourceKey::new("https://ec2.example.com", "AKIA");
        let keypair = driver.keypair_name("gm-1");
        let params = SubmitParams {
            target: &target,
            submit_key: "gm-1",
            keypair: keypair.as_deref(),
            staging_url: None,
            attributes: vec![("Ec2AmiId".to_string(), "ami-7".to_string())],
        };
        let request = driver.submit_request(&params);
        assert_eq!(request, driver.submit_request(&params));
        assert_eq!(request.command, "EC2_VM_START");
        assert_eq!(
            request.args,
            vec![
                "https://ec2.example.com",
                "AKIA",
                "gm-1",
                "keypair=gm-1-key",
                "Ec2AmiId=ami-7"
            ]
        );
    }

    #[test]
    fn test_keypairs_only_for_ec2() {
        let target = ResourceKey::new("x", "y");
        let ec2 = create_driver("EC2").unwrap();
        let gce = create_driver("gce").unwrap();
        assert!(ec2.create_keypair_request(&target, "k").is_some());
        assert!(gce.keypair_name("gm-1").is_none());
        assert!(gce.destroy_keypair_request(&target, "k").is_none());
        assert!(create_driver("condor").is_none());
    }

    #[test]
    fn test_submit_keys_are_unique() {
        let driver = create_driver("batch").unwrap();
        let a = driver.new_submit_key();
        assert!(a.starts_with("gm-"));
        assert_eq!(a.len(), 3 + 32);
        assert_ne!(a, driver.new_submit_key());
        assert!(driver.needs_staging());
    }
}
