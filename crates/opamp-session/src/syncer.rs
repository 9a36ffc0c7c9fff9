//! Package sync progress handle given to `on_packages_available`.

use std::sync::Arc;

use opamp_core::{PackagesSyncer, protocol::PackageStatus};

use crate::state::{SessionState, SyncOutcome};

pub(crate) struct SessionPackagesSyncer {
    state: Arc<SessionState>,
    all_packages_hash: Vec<u8>,
}

impl SessionPackagesSyncer {
    pub(crate) fn new(state: Arc<SessionState>, all_packages_hash: Vec<u8>) -> Self {
        Self {
            state,
            all_packages_hash,
        }
    }
}

impl PackagesSyncer for SessionPackagesSyncer {
    fn report_status(&self, status: PackageStatus) {
        tracing::debug!(package = %status.name, state = ?status.status, "package status");
        self.state.set_package_status(status);
        self.state.notify_urgent();
    }

    fn done(&self) {
        self.state
            .end_package_sync(&self.all_packages_hash, SyncOutcome::Done);
        self.state.notify_urgent();
    }

    fn fail(&self, error_message: String) {
        tracing::warn!(error = %error_message, "package sync failed");
        self.state.set_packages_error(error_message);
        self.state
            .end_package_sync(&self.all_packages_hash, SyncOutcome::Failed);
        self.state.notify_urgent();
    }
}
