use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GmState {
    Init,
    Start,
    ClearRequest,
    SaveSubmitKey,
    CreateKeypair,
    Submit,
    SaveRemoteId,
    SeekRemoteId,
    Submitted,
    Probe,
    Cancel,
    DoneSave,
    DestroyKeypair,
    Hold,
    ProxyExpired,
    Delete,
}

impl GmState {
    pub const ALL: [GmState; 16] = [
        GmState::Init,
        GmState::Start,
        GmState::ClearRequest,
        GmState::SaveSubmitKey,
        GmState::CreateKeypair,
        GmState::Submit,
        GmState::SaveRemoteId,
        GmState::SeekRemoteId,
        GmState::Submitted,
        GmState::Probe,
        GmState::Cancel,
        GmState::DoneSave,
        GmState::DestroyKeypair,
        GmState::Hold,
        GmState::ProxyExpired,
        GmState::Delete,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GmState::Init => "INIT",
            GmState::Start => "START",
            GmState::ClearRequest => "CLEAR_REQUEST",
            GmState::SaveSubmitKey => "SAVE_SUBMIT_KEY",
            GmState::CreateKeypair => "CREATE_KEYPAIR",
            GmState::Submit => "SUBMIT",
            GmState::SaveRemoteId => "SAVE_REMOTE_ID",
            GmState::SeekRemoteId => "SEEK_REMOTE_ID",
            GmState::Submitted => "SUBMITTED",
            GmState::Probe => "PROBE",
            GmState::Cancel => "CANCEL",
            GmState::DoneSave => "DONE_SAVE",
            GmState::DestroyKeypair => "DESTROY_KEYPAIR",
            GmState::Hold => "HOLD",
            GmState::ProxyExpired => "PROXY_EXPIRED",
            GmState::Delete => "DELETE",
        }
    }

    /// States that the regular transition table allows to follow this one.
    pub fn successors(self) -> &'static [GmState] {
        use GmState::*;
        match self {
            Init => &[Start, Hold, Delete],
            Start => &[ClearRequest, SeekRemoteId, Submitted],
            ClearRequest => &[Hold, Delete, SaveSubmitKey],
            SaveSubmitKey => &[ClearRequest, CreateKeypair, Submit],
            CreateKeypair => &[ClearRequest, Submit, Hold],
            Submit => &[
                Hold,
                ClearRequest,
                DestroyKeypair,
                SaveRemoteId,
                SeekRemoteId,
            ],
            SaveRemoteId => &[Submitted],
            SeekRemoteId => &[SaveRemoteId, Submit, Delete, Hold],
            Submitted => &[DoneSave, Cancel, Probe],
            Probe => &[Submitted, Cancel, Hold],
            Cancel => &[Hold, DestroyKeypair, Delete, ClearRequest],
            DoneSave => &[Cancel],
            DestroyKeypair => &[Delete, Hold],
            Hold => &[Delete],
            // Resumes whatever state was interrupted
            ProxyExpired => &GmState::ALL,
            Delete => &[],
        }
    }

    /// Any state that still has remote work ahead can be interrupted by an expiring credential.
    pub fn is_interruptible(self) -> bool {
        !matches!(
            self,
            GmState::Hold | GmState::ProxyExpired | GmState::Delete
        )
    }

    pub fn can_transition_to(self, next: GmState) -> bool {
        (next == GmState::ProxyExpired && self.is_interruptible())
            || self.successors().contains(&next)
    }
}

impl Display for GmState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
