use std::fmt::{Display, Formatter};

/// Parsed `GridResource` attribute: `"<kind> <url> [extra...]"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridResource {
    pub kind: String,
    pub endpoint: String,
    pub extra: Vec<String>,
}

impl GridResource {
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut parts = text.split_whitespace();
        let kind = parts
            .next()
            .ok_or_else(|| "GridResource is empty".to_string())?;
        let endpoint = parts
            .next()
            .ok_or_else(|| format!("GridResource {text:?} is missing the service URL"))?;
        Ok(Self {
            kind: kind.to_ascii_lowercase(),
            endpoint: endpoint.to_string(),
            extra: parts.map(|s| s.to_string()).collect(),
        })
    }
}

/// Parsed `GridJobId` attribute: `"<kind> <url> <submit key> [<remote handle>]"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridJobId {
    pub kind: String,
    pub endpoint: String,
    pub submit_key: String,
    pub handle: Option<String>,
}

impl GridJobId {
    pub fn new(kind: &str, endpoint: &str, submit_key: &str) -> Self {
        Self {
            kind: kind.to_string(),
            endpoint: endpoint.to_string(),
            submit_key: submit_key.to_string(),
            handle: None,
        }
    }

    pub fn with_handle(mut self, handle: &str) -> Self {
        self.handle = Some(handle.to_string());
        self
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let parts: Vec<&str> = text.split_whitespace().collect();
        match parts.as_slice() {
            [kind, endpoint, key] => Ok(Self::new(kind, endpoint, key)),
            [kind, endpoint, key, handle] => Ok(Self::new(kind, endpoint, key).with_handle(handle)),
            _ => Err(format!("Malformed GridJobId {text:?}")),
        }
    }
}

impl Display for GridJobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.kind, self.endpoint, self.submit_key)?;
        if let Some(handle) = &self.handle {
            write!(f, " {handle}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{GridJobId, GridResource};

    #[test]
    fn test_parse_grid_resource() {
        let resource = GridResource::parse("EC2  https://ec2.amazonaws.com  AKIA").unwrap();
        assert_eq!(resource.kind, "ec2");
        assert_eq!(resource.endpoint, "https://ec2.amazonaws.com");
        assert_eq!(resource.extra, vec!["AKIA".to_string()]);

        assert!(GridResource::parse("").is_err());
        assert!(GridResource::parse("gce").is_err());
    }

    #[test]
    fn test_grid_job_id() {
        let id = GridJobId::parse("gce https://gce gm-1").unwrap();
        assert_eq!(id.handle, None);
        let id = id.with_handle("instance-7");
        assert_eq!(id.to_string(), "gce https://gce gm-1 instance-7");
        assert_eq!(GridJobId::parse(&id.to_string()).unwrap(), id);
        assert!(GridJobId::parse("gce https://gce").is_err());
    }
}
