//! Names of job record attributes.

pub const JOB_STATUS: &str = "JobStatus";
pub const ENTERED_CURRENT_STATUS: &str = "EnteredCurrentStatus";
pub const ENTERED_CURRENT_GM_STATE: &str = "EnteredCurrentGmState";
pub const GRID_RESOURCE: &str = "GridResource";
pub const GRID_JOB_ID: &str = "GridJobId";
pub const GRID_JOB_STATUS: &str = "GridJobStatus";
pub const HOLD_REASON: &str = "HoldReason";
pub const HOLD_REASON_CODE: &str = "HoldReasonCode";
pub const HOLD_REASON_SUBCODE: &str = "HoldReasonSubCode";
pub const NUM_SYSTEM_HOLDS: &str = "NumSystemHolds";
pub const MANAGED: &str = "Managed";
pub const NUM_SUBMIT_ATTEMPTS: &str = "NumGlobusSubmits";
pub const CURRENT_STATUS_UNKNOWN: &str = "CurrentStatusUnknown";
pub const LAST_REMOTE_STATUS_UPDATE: &str = "LastRemoteStatusUpdate";
pub const GRID_RESOURCE_UNAVAILABLE_TIME: &str = "GridResourceUnavailableTime";
pub const X509_USER_PROXY: &str = "x509userproxy";
pub const X509_USER_PROXY_SUBJECT: &str = "x509UserProxySubject";
pub const X509_USER_PROXY_EXPIRATION: &str = "x509UserProxyExpiration";
pub const NONESSENTIAL: &str = "Nonessential";
pub const RESUBMIT_CHECK: &str = "ResubmitCheck";
pub const WANT_RESUBMIT: &str = "WantGridResubmit";
pub const REMATCH_CHECK: &str = "RematchCheck";
pub const WANT_REMATCH: &str = "WantRematch";
pub const STAGING_URL: &str = "StagingUrl";

/// Values of [`MANAGED`]
pub const MANAGED_EXTERNAL: &str = "External";
pub const MANAGED_SCHEDD: &str = "Schedd";
pub const MANAGED_DONE: &str = "Done";

/// Hold code used for every hold raised by the state machine.
pub const HOLD_CODE_GRID_ERROR: i64 = 27;
