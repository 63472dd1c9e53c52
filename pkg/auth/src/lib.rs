use schema::{
    AccessLevel, Acl, AclEntryKind, ApplicationDefinition, ApplicationId, AuthState,
    DataEncryption, ParameterStore, Principal, Request, RequestType, RequestTypeMap,
    ResponseSink,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("authentication required for '{resource}'")]
    AuthenticationRequired {
        resource: String,
        session_id: Option<String>,
    },
    #[error("authentication failed for '{resource}': {reason}")]
    AuthenticationFailed {
        resource: String,
        session_id: Option<String>,
        reason: String,
    },
    #[error("'{principal}' is not authorized for {requested:?} on '{resource}'")]
    AuthorizationDenied {
        principal: String,
        resource: String,
        session_id: Option<String>,
        requested: AccessLevel,
        held: AccessLevel,
    },
    #[error("'{resource}' requires a secure connection")]
    EncryptionRequired { resource: String },
}

impl AccessError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthenticationRequired { .. } => "authentication_required",
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::AuthorizationDenied { .. } => "authorization_denied",
            Self::EncryptionRequired { .. } => "encryption_required",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::AuthenticationRequired { .. } | Self::AuthenticationFailed { .. } => 401,
            Self::AuthorizationDenied { .. } | Self::EncryptionRequired { .. } => 403,
        }
    }

    pub fn resource(&self) -> &str {
        match self {
            Self::AuthenticationRequired { resource, .. }
            | Self::AuthenticationFailed { resource, .. }
            | Self::AuthorizationDenied { resource, .. }
            | Self::EncryptionRequired { resource } => resource,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::AuthenticationRequired { session_id, .. }
            | Self::AuthenticationFailed { session_id, .. }
            | Self::AuthorizationDenied { session_id, .. } => session_id.as_deref(),
            Self::EncryptionRequired { .. } => None,
        }
    }

    pub fn principal(&self) -> Option<&str> {
        match self {
            Self::AuthorizationDenied { principal, .. } => Some(principal),
            _ => None,
        }
    }

    /// Replaces the response with a structured failure carrying the audit fields.
    pub fn write_response(&self, response: &mut impl ResponseSink) {
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
            "principal": self.principal(),
            "resource": self.resource(),
            "session_id": self.session_id(),
        });
        response.clear();
        response.set_status(self.status());
        response.set_content("application/json", body.to_string().into_bytes());
        response.mark_error(self.code());
        if matches!(self, Self::AuthenticationRequired { .. }) {
            response.set_header("www-authenticate", "Basic realm=\"dispatcher\"");
        }
    }
}

/// Outcome of one access evaluation; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub request_type: RequestType,
    pub requested: AccessLevel,
    pub held: AccessLevel,
    pub allowed: bool,
    pub principal: Option<String>,
    pub resource: String,
    pub session_id: Option<String>,
    pub denial: Option<AccessError>,
}

impl AccessDecision {
    pub fn into_result(self) -> Result<AccessDecision, AccessError> {
        match self.denial.clone() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessController {
    application_id: ApplicationId,
    resource: String,
    acl: Acl,
    request_types: RequestTypeMap,
    encryption: DataEncryption,
}

impl AccessController {
    pub fn new(application: &ApplicationDefinition) -> Self {
        Self {
            application_id: application.id,
            resource: format!("/{}", application.request_root.trim_matches('/')),
            acl: application.acl.clone(),
            request_types: application.request_types.clone(),
            encryption: application.encryption,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn classify_request_type(&self, request: &Request) -> RequestType {
        let Some(raw) = request.parameter(&self.request_types.parameter) else {
            return RequestType::Unknown;
        };
        let raw = raw.trim();
        let map = &self.request_types;
        if raw.eq_ignore_ascii_case(&map.query) {
            RequestType::Query
        } else if raw.eq_ignore_ascii_case(&map.insert) {
            RequestType::Insert
        } else if raw.eq_ignore_ascii_case(&map.update) {
            RequestType::Update
        } else if raw.eq_ignore_ascii_case(&map.delete) {
            RequestType::Delete
        } else {
            RequestType::Unknown
        }
    }

    pub fn check_encryption(&self, request: &Request) -> Result<(), AccessError> {
        match self.encryption {
            DataEncryption::RequireSecure if !request.is_secure() => {
                Err(AccessError::EncryptionRequired {
                    resource: self.resource_for(request),
                })
            }
            _ => Ok(()),
        }
    }

    /// User entries win outright; otherwise role grants are unioned, and the
    /// `anyone` entries apply when nothing more specific matched.
    pub fn held_access(&self, principal: Option<&Principal>) -> AccessLevel {
        let mut anyone = AccessLevel::empty();
        let mut roles = AccessLevel::empty();
        let mut role_matched = false;
        for entry in &self.acl.entries {
            match entry.kind {
                AclEntryKind::Anyone => anyone |= entry.access,
                AclEntryKind::User => {
                    if let Some(principal) = principal
                        && entry.name.eq_ignore_ascii_case(&principal.name)
                    {
                        return entry.access;
                    }
                }
                AclEntryKind::Role => {
                    if let Some(principal) = principal
                        && principal
                            .roles
                            .iter()
                            .any(|role| role.eq_ignore_ascii_case(&entry.name))
                    {
                        roles |= entry.access;
                        role_matched = true;
                    }
                }
            }
        }
        if role_matched { roles } else { anyone }
    }

    pub fn check_access(
        &self,
        request: &mut Request,
        request_type: RequestType,
        reply_on_error: bool,
    ) -> AccessDecision {
        let requested = request_type.required_access();
        let resource = self.resource_for(request);
        let session_id = request.session_id().map(str::to_string);
        let auth_state = request
            .session()
            .map(|session| session.auth_state())
            .unwrap_or_default();

        let (principal, failure) = match auth_state {
            AuthState::Anonymous => (None, None),
            AuthState::Authenticated(principal) => (Some(principal), None),
            AuthState::Failed { reason } => (None, Some(reason)),
        };

        let held = match request.cached_access(self.application_id) {
            Some(level) => level,
            None => {
                let level = self.held_access(principal.as_ref());
                request.cache_access(self.application_id, level);
                level
            }
        };

        let denial = if let Some(reason) = failure {
            Some(AccessError::AuthenticationFailed {
                resource: resource.clone(),
                session_id: session_id.clone(),
                reason,
            })
        } else if held.contains(requested) {
            None
        } else if let Some(principal) = principal.as_ref() {
            Some(AccessError::AuthorizationDenied {
                principal: principal.display_name.clone(),
                resource: resource.clone(),
                session_id: session_id.clone(),
                requested,
                held,
            })
        } else {
            Some(AccessError::AuthenticationRequired {
                resource: resource.clone(),
                session_id: session_id.clone(),
            })
        };

        if let Some(err) = denial.as_ref() {
            log::debug!(
                "access denied on '{}' ({}): requested={:?} held={:?} session={:?}",
                resource,
                err.code(),
                requested,
                held,
                session_id
            );
            if reply_on_error {
                err.write_response(request.response_mut());
            }
        }

        AccessDecision {
            request_type,
            requested,
            held,
            allowed: denial.is_none(),
            principal: principal.map(|principal| principal.display_name),
            resource,
            session_id,
            denial,
        }
    }

    fn resource_for(&self, request: &Request) -> String {
        if request.page_path().is_empty() {
            self.resource.clone()
        } else {
            format!("{}/{}", self.resource, request.page_path())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use schema::{Response, Session};

    fn sample_application() -> ApplicationDefinition {
        let mut app = ApplicationDefinition::new(11, "catalog", "catalog", 4);
        app.acl = Acl::default()
            .with_entry("Anonymous", AclEntryKind::Anyone, AccessLevel::QUERY)
            .with_entry(
                "editors",
                AclEntryKind::Role,
                AccessLevel::QUERY | AccessLevel::INSERT | AccessLevel::UPDATE,
            )
            .with_entry("auditor", AclEntryKind::User, AccessLevel::QUERY)
            .with_entry("admins", AclEntryKind::Role, AccessLevel::all());
        app
    }

    fn request_as(principal: Option<Principal>) -> Request {
        let request = Request::new("catalog", "search.xml");
        match principal {
            Some(principal) => request.with_session(Arc::new(Session::authenticated("s-1", principal))),
            None => request,
        }
    }

    #[test]
    fn classify_request_type_uses_configured_parameter() {
        let mut app = sample_application();
        app.request_types.parameter = "action".into();
        app.request_types.insert = "create".into();
        let controller = AccessController::new(&app);

        let insert = Request::new("catalog", "items.xml").with_param("action", "CREATE");
        assert_eq!(controller.classify_request_type(&insert), RequestType::Insert);
        let delete = Request::new("catalog", "items.xml").with_param("action", "delete");
        assert_eq!(controller.classify_request_type(&delete), RequestType::Delete);
        let legacy = Request::new("catalog", "items.xml").with_param("DBActionType", "INSERT");
        assert_eq!(controller.classify_request_type(&legacy), RequestType::Unknown);
        let bogus = Request::new("catalog", "items.xml").with_param("action", "purge");
        assert_eq!(controller.classify_request_type(&bogus), RequestType::Unknown);
    }

    #[test]
    fn held_access_prefers_user_entry_over_roles() {
        let controller = AccessController::new(&sample_application());
        let auditor = Principal::new("Auditor", &["admins"]);
        assert_eq!(controller.held_access(Some(&auditor)), AccessLevel::QUERY);

        let editor = Principal::new("erin", &["Editors"]);
        assert_eq!(
            controller.held_access(Some(&editor)),
            AccessLevel::QUERY | AccessLevel::INSERT | AccessLevel::UPDATE
        );

        let stranger = Principal::new("sam", &["visitors"]);
        assert_eq!(controller.held_access(Some(&stranger)), AccessLevel::QUERY);
        assert_eq!(controller.held_access(None), AccessLevel::QUERY);
    }

    #[test]
    fn query_only_principal_is_denied_insert_with_reply() {
        let mut app = sample_application();
        app.acl = Acl::default().with_entry("reader", AclEntryKind::User, AccessLevel::QUERY);
        let controller = AccessController::new(&app);
        let mut request = request_as(Some(Principal::new("reader", &[])));

        let decision = controller.check_access(&mut request, RequestType::Insert, true);
        assert!(!decision.allowed);
        assert_eq!(decision.held, AccessLevel::QUERY);
        let err = decision.into_result().unwrap_err();
        assert_eq!(err.code(), "authorization_denied");
        assert_eq!(request.response().status, 403);
        assert_eq!(
            request.response().error_code.as_deref(),
            Some("authorization_denied")
        );
        let body = request.response().body_text();
        assert!(body.contains("\"principal\":\"reader\""));
        assert!(body.contains("\"session_id\":\"s-1\""));
        assert!(body.contains("\"resource\":\"/catalog/search.xml\""));
    }

    #[test]
    fn denial_without_reply_leaves_response_untouched() {
        let mut app = sample_application();
        app.acl = Acl::default();
        let controller = AccessController::new(&app);
        let mut request = request_as(Some(Principal::new("reader", &[])));

        let decision = controller.check_access(&mut request, RequestType::Query, false);
        assert!(!decision.allowed);
        assert_eq!(request.response(), &Response::default());
    }

    #[test]
    fn identity_failures_have_distinct_codes() {
        let mut app = sample_application();
        app.acl = Acl::default().with_entry("editors", AclEntryKind::Role, AccessLevel::all());
        let controller = AccessController::new(&app);

        let mut anonymous = request_as(None);
        let required = controller
            .check_access(&mut anonymous, RequestType::Query, true)
            .into_result()
            .unwrap_err();
        assert_eq!(required.code(), "authentication_required");
        assert_eq!(anonymous.response().status, 401);

        let session = Session::anonymous("s-9");
        session.set_auth_state(AuthState::Failed {
            reason: "bad password".into(),
        });
        let mut failed = Request::new("catalog", "search.xml").with_session(Arc::new(session));
        let failure = controller
            .check_access(&mut failed, RequestType::Query, true)
            .into_result()
            .unwrap_err();
        assert_eq!(failure.code(), "authentication_failed");
        assert_eq!(failure.session_id(), Some("s-9"));

        let mut outsider = request_as(Some(Principal::new("sam", &["visitors"])));
        let denied = controller
            .check_access(&mut outsider, RequestType::Query, true)
            .into_result()
            .unwrap_err();
        assert_eq!(denied.code(), "authorization_denied");
        assert_ne!(required.code(), failure.code());
    }

    #[test]
    fn held_access_is_cached_on_the_request() {
        let controller = AccessController::new(&sample_application());
        let mut request = request_as(Some(Principal::new("erin", &["editors"])));
        controller.check_access(&mut request, RequestType::Query, false);
        assert_eq!(
            request.cached_access(11),
            Some(AccessLevel::QUERY | AccessLevel::INSERT | AccessLevel::UPDATE)
        );
        assert_eq!(request.cached_access(12), None);
    }

    #[test]
    fn encryption_policy_rejects_plain_requests() {
        let mut app = sample_application();
        app.encryption = DataEncryption::RequireSecure;
        let controller = AccessController::new(&app);

        let plain = Request::new("catalog", "search.xml");
        assert_eq!(
            controller.check_encryption(&plain).unwrap_err().code(),
            "encryption_required"
        );
        let secure = Request::new("catalog", "search.xml").with_secure(true);
        assert!(controller.check_encryption(&secure).is_ok());
    }
}
