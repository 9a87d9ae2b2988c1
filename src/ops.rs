//! Generated operation refs
//!
//! One constant per operation in the bundled API definitions, so call
//! sites can name an endpoint without string literals. Keep this module
//! in lockstep with `apidef/`: the registry rejects refs that name
//! nothing in the loaded set.

use crate::operation::OperationRef;

// =============================================================================
// SECURITY
// =============================================================================

pub mod security {
    use super::OperationRef;

    /// Exchange credentials for a bearer token
    pub const LOGIN: OperationRef = OperationRef::new("security", "login");

    /// Exchange a refresh credential for a fresh bearer token
    pub const REFRESH: OperationRef = OperationRef::new("security", "refresh");

    /// Issue a reduced-scope token
    pub const ISSUE_RESTRICTED: OperationRef = OperationRef::new("security", "issue_restricted");
}

// =============================================================================
// GROUPS
// =============================================================================

pub mod groups {
    use super::OperationRef;

    /// List groups
    pub const LIST: OperationRef = OperationRef::new("groups", "list");

    /// Fetch one group
    pub const GET: OperationRef = OperationRef::new("groups", "get");

    /// Mark or unmark a group as organizational
    pub const SET_ORGANIZATIONAL: OperationRef =
        OperationRef::new("groups", "set_organizational");

    /// Archive or unarchive a group
    pub const SET_ARCHIVED: OperationRef = OperationRef::new("groups", "set_archived");

    /// Add a member with a role
    pub const ADD_MEMBER: OperationRef = OperationRef::new("groups", "add_member");

    /// Remove a member
    pub const REMOVE_MEMBER: OperationRef = OperationRef::new("groups", "remove_member");
}

// =============================================================================
// USERS
// =============================================================================

pub mod users {
    use super::OperationRef;

    /// Fetch one user
    pub const GET: OperationRef = OperationRef::new("users", "get");

    /// List users
    pub const LIST: OperationRef = OperationRef::new("users", "list");

    /// Update profile fields
    pub const UPDATE_PROFILE: OperationRef = OperationRef::new("users", "update_profile");
}

// =============================================================================
// REGISTRATION
// =============================================================================

pub mod registration {
    use super::OperationRef;

    /// Invite a new user into a set of groups
    pub const CREATE_INVITATION: OperationRef =
        OperationRef::new("registration", "create_invitation");
}

// =============================================================================
// UPLOADED FILES
// =============================================================================

pub mod uploaded_files {
    use super::OperationRef;

    /// Single-shot upload of a small file
    pub const UPLOAD: OperationRef = OperationRef::new("uploaded_files", "upload");

    /// Fetch file metadata
    pub const DETAIL: OperationRef = OperationRef::new("uploaded_files", "detail");

    /// Download file contents
    pub const DOWNLOAD: OperationRef = OperationRef::new("uploaded_files", "download");

    /// Open a chunked upload
    pub const START_PARTIAL: OperationRef = OperationRef::new("uploaded_files", "start_partial");

    /// Append one chunk
    pub const APPEND_PARTIAL: OperationRef =
        OperationRef::new("uploaded_files", "append_partial");

    /// Close a chunked upload
    pub const COMPLETE_PARTIAL: OperationRef =
        OperationRef::new("uploaded_files", "complete_partial");

    /// Abandon a chunked upload
    pub const CANCEL_PARTIAL: OperationRef =
        OperationRef::new("uploaded_files", "cancel_partial");
}
