use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bitflags::bitflags;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub type ApplicationId = u64;
pub type DatasetId = u32;

// ---------------------------------------------------------------------------
// Capability bitmasks
// ---------------------------------------------------------------------------

bitflags! {
    /// Data capabilities a principal may hold against an application.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct AccessLevel: u32 {
        const QUERY = 0x01;
        const INSERT = 0x02;
        const UPDATE = 0x04;
        const DELETE = 0x08;
    }
}

bitflags! {
    /// Interfaces an extension declares it implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ExtensionCapabilities: u32 {
        const REQUEST_PRE_PROCESSOR = 0x01;
        const RESULT_DOCUMENT_PROCESSOR = 0x02;
        const UDF = 0x04;
        const UPDATE_LISTENER = 0x08;
    }
}

impl Default for AccessLevel {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for ExtensionCapabilities {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestType {
    #[default]
    Unknown,
    Query,
    Insert,
    Update,
    Delete,
}

impl RequestType {
    /// Unknown requests are checked as queries.
    pub fn required_access(self) -> AccessLevel {
        match self {
            Self::Unknown | Self::Query => AccessLevel::QUERY,
            Self::Insert => AccessLevel::INSERT,
            Self::Update => AccessLevel::UPDATE,
            Self::Delete => AccessLevel::DELETE,
        }
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, Self::Unknown | Self::Query)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Query => "query",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

// ---------------------------------------------------------------------------
// Design-time definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclEntryKind {
    #[default]
    User,
    Role,
    Anyone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub name: String,
    #[serde(default)]
    pub kind: AclEntryKind,
    pub access: AccessLevel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    #[serde(default)]
    pub entries: Vec<AclEntry>,
}

impl Acl {
    pub fn with_entry(mut self, name: &str, kind: AclEntryKind, access: AccessLevel) -> Self {
        self.entries.push(AclEntry {
            name: name.to_string(),
            kind,
            access,
        });
        self
    }
}

/// Maps the action parameter of a request onto a [`RequestType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestTypeMap {
    pub parameter: String,
    pub query: String,
    pub insert: String,
    pub update: String,
    pub delete: String,
}

impl Default for RequestTypeMap {
    fn default() -> Self {
        Self {
            parameter: "DBActionType".to_string(),
            query: "QUERY".to_string(),
            insert: "INSERT".to_string(),
            update: "UPDATE".to_string(),
            delete: "DELETE".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataEncryption {
    #[default]
    None,
    RequireSecure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetClass {
    #[default]
    Query,
    Update,
    ContentEditor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Equals,
    NotEquals,
    Exists,
    Absent,
}

/// One term of a dataset's selection criteria, evaluated against request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub parameter: String,
    pub op: ConditionOp,
    #[serde(default)]
    pub value: Option<String>,
}

impl Condition {
    pub fn equals(parameter: &str, value: &str) -> Self {
        Self {
            parameter: parameter.to_string(),
            op: ConditionOp::Equals,
            value: Some(value.to_string()),
        }
    }

    pub fn exists(parameter: &str) -> Self {
        Self {
            parameter: parameter.to_string(),
            op: ConditionOp::Exists,
            value: None,
        }
    }

    pub fn matches(&self, params: &Parameters) -> bool {
        let values = params.values(&self.parameter);
        match self.op {
            ConditionOp::Exists => !values.is_empty(),
            ConditionOp::Absent => values.is_empty(),
            ConditionOp::Equals => match self.value.as_deref() {
                Some(expected) => values.iter().any(|value| value == expected),
                None => values.iter().all(|value| value.is_empty()),
            },
            ConditionOp::NotEquals => match self.value.as_deref() {
                Some(expected) => values.iter().all(|value| value != expected),
                None => values.iter().any(|value| !value.is_empty()),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicyDefinition {
    pub enabled: bool,
    /// Parameters that form the cache fingerprint; empty means all of them.
    pub key_parameters: Vec<String>,
    pub key_headers: Vec<String>,
    pub cache_empty_results: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionReference {
    pub name: String,
    pub requires: ExtensionCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionDescriptor {
    pub name: String,
    pub capabilities: ExtensionCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDefinition {
    pub id: DatasetId,
    pub name: String,
    /// Request page the dataset answers, e.g. `search.xml`.
    pub page: String,
    #[serde(default)]
    pub class: DatasetClass,
    /// Handler type understood by the deployment's handler factory.
    pub handler: String,
    #[serde(default)]
    pub selector: Vec<Condition>,
    #[serde(default)]
    pub cache: Option<CachePolicyDefinition>,
    #[serde(default)]
    pub extensions: Vec<ExtensionReference>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl DatasetDefinition {
    pub fn new(id: DatasetId, name: &str, page: &str, handler: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            page: page.to_string(),
            class: DatasetClass::Query,
            handler: handler.to_string(),
            selector: Vec::new(),
            cache: None,
            extensions: Vec::new(),
            settings: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationDefinition {
    pub id: ApplicationId,
    pub name: String,
    pub request_root: String,
    #[serde(default)]
    pub static_root: Option<PathBuf>,
    #[serde(default)]
    pub acl: Acl,
    /// Declared ceiling in milliseconds; zero leaves it undeclared.
    #[serde(default)]
    pub max_request_time_ms: u64,
    /// Second admission ceiling; zero leaves it unset.
    #[serde(default)]
    pub max_queued_requests: usize,
    pub max_threads: usize,
    #[serde(default)]
    pub encryption: DataEncryption,
    #[serde(default)]
    pub default_page: Option<String>,
    #[serde(default)]
    pub request_types: RequestTypeMap,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub datasets: Vec<DatasetDefinition>,
}

fn default_enabled() -> bool {
    true
}

impl ApplicationDefinition {
    pub fn new(id: ApplicationId, name: &str, request_root: &str, max_threads: usize) -> Self {
        Self {
            id,
            name: name.to_string(),
            request_root: request_root.to_string(),
            static_root: None,
            acl: Acl::default(),
            max_request_time_ms: 0,
            max_queued_requests: 0,
            max_threads,
            encryption: DataEncryption::None,
            default_page: None,
            request_types: RequestTypeMap::default(),
            enabled: true,
            datasets: Vec::new(),
        }
    }

    /// Admission ceiling after folding in the queued-request limit.
    pub fn admission_ceiling(&self) -> usize {
        let ceiling = self.max_threads.max(1);
        if self.max_queued_requests > 0 {
            ceiling.min(self.max_queued_requests)
        } else {
            ceiling
        }
    }

    pub fn extension_names(&self) -> impl Iterator<Item = &str> {
        self.datasets
            .iter()
            .flat_map(|dataset| dataset.extensions.iter().map(|ext| ext.name.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Identity and session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub display_name: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(name: &str, roles: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            display_name: name.to_string(),
            roles: roles.iter().map(|role| role.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Anonymous,
    Authenticated(Principal),
    /// Credentials were presented and rejected.
    Failed { reason: String },
}

pub trait SessionStore: Send + Sync + fmt::Debug {
    fn session_id(&self) -> &str;
    fn auth_state(&self) -> AuthState;
    fn value(&self, key: &str) -> Option<String>;
    fn set_value(&self, key: &str, value: String);
    fn remove_value(&self, key: &str) -> Option<String>;
}

#[derive(Debug)]
pub struct Session {
    id: String,
    auth: RwLock<AuthState>,
    values: RwLock<HashMap<String, String>>,
}

impl Session {
    pub fn anonymous(id: &str) -> Self {
        Self {
            id: id.to_string(),
            auth: RwLock::new(AuthState::Anonymous),
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn authenticated(id: &str, principal: Principal) -> Self {
        let session = Self::anonymous(id);
        *session.auth.write() = AuthState::Authenticated(principal);
        session
    }

    pub fn set_auth_state(&self, state: AuthState) {
        *self.auth.write() = state;
    }
}

impl SessionStore for Session {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn auth_state(&self) -> AuthState {
        self.auth.read().clone()
    }

    fn value(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set_value(&self, key: &str, value: String) {
        self.values.write().insert(key.to_string(), value);
    }

    fn remove_value(&self, key: &str) -> Option<String> {
        self.values.write().remove(key)
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

pub trait ParameterStore {
    fn parameter(&self, name: &str) -> Option<&str>;
    fn parameter_values(&self, name: &str) -> &[String];
    fn set_parameter(&mut self, name: &str, value: String);
    fn append_parameter(&mut self, name: &str, value: String);
    fn remove_parameter(&mut self, name: &str) -> Option<Vec<String>>;
}

/// Multi-valued request parameters in deterministic name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters {
    values: BTreeMap<String, Vec<String>>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.values.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.values
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl ParameterStore for Parameters {
    fn parameter(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    fn parameter_values(&self, name: &str) -> &[String] {
        self.values(name)
    }

    fn set_parameter(&mut self, name: &str, value: String) {
        self.values.insert(name.to_string(), vec![value]);
    }

    fn append_parameter(&mut self, name: &str, value: String) {
        self.values.entry(name.to_string()).or_default().push(value);
    }

    fn remove_parameter(&mut self, name: &str) -> Option<Vec<String>> {
        self.values.remove(name)
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

pub trait ResponseSink {
    fn set_status(&mut self, status: u16);
    fn set_header(&mut self, name: &str, value: &str);
    fn set_content(&mut self, content_type: &str, body: Vec<u8>);
    fn mark_error(&mut self, code: &str);
    fn is_error_response(&self) -> bool;
    /// Drops status, headers and body written so far.
    fn clear(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub error_code: Option<String>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            content_type: "text/plain; charset=utf-8".to_string(),
            headers: BTreeMap::new(),
            body: Vec::new(),
            error_code: None,
        }
    }
}

impl Response {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl ResponseSink for Response {
    fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
    }

    fn set_content(&mut self, content_type: &str, body: Vec<u8>) {
        self.content_type = content_type.to_string();
        self.body = body;
    }

    fn mark_error(&mut self, code: &str) {
        self.error_code = Some(code.to_string());
    }

    fn is_error_response(&self) -> bool {
        self.error_code.is_some() || self.status >= 400
    }

    fn clear(&mut self) {
        self.reset();
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct Request {
    request_id: u64,
    request_root: String,
    page_path: String,
    dataset_hint: Option<String>,
    params: Parameters,
    cookies: HashMap<String, String>,
    headers: HashMap<String, String>,
    session: Option<Arc<dyn SessionStore>>,
    input_document: Option<Vec<u8>>,
    secure: bool,
    response: Response,
    cached_access: Option<(ApplicationId, AccessLevel)>,
    cache_eligible: bool,
}

impl Request {
    pub fn new(request_root: &str, page_path: &str) -> Self {
        Self {
            request_id: REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed),
            request_root: request_root.trim_matches('/').to_string(),
            page_path: page_path.trim_start_matches('/').to_string(),
            dataset_hint: None,
            params: Parameters::new(),
            cookies: HashMap::new(),
            headers: HashMap::new(),
            session: None,
            input_document: None,
            secure: false,
            response: Response::default(),
            cached_access: None,
            cache_eligible: false,
        }
    }

    /// Splits `/root/page/path` into the request root and the page path below it.
    pub fn from_url_path(path: &str) -> Self {
        let trimmed = path.trim_start_matches('/');
        let (root, page) = trimmed.split_once('/').unwrap_or((trimmed, ""));
        Self::new(root, page)
    }

    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.params.append_parameter(name, value.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_session(mut self, session: Arc<dyn SessionStore>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_dataset_hint(mut self, dataset: &str) -> Self {
        self.dataset_hint = Some(dataset.to_string());
        self
    }

    pub fn with_input_document(mut self, document: Vec<u8>) -> Self {
        self.input_document = Some(document);
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn request_root(&self) -> &str {
        &self.request_root
    }

    pub fn page_path(&self) -> &str {
        &self.page_path
    }

    /// Last path segment of the page path, extension included.
    pub fn page_name(&self) -> &str {
        self.page_path
            .rsplit('/')
            .next()
            .unwrap_or(self.page_path.as_str())
    }

    pub fn page_name_without_extension(&self) -> &str {
        strip_extension(self.page_name())
    }

    pub fn page_extension(&self) -> Option<&str> {
        let page = self.page_name();
        page.rfind('.')
            .filter(|idx| *idx > 0)
            .map(|idx| &page[idx + 1..])
    }

    pub fn dataset_hint(&self) -> Option<&str> {
        self.dataset_hint.as_deref()
    }

    pub fn set_dataset_hint(&mut self, dataset: Option<String>) {
        self.dataset_hint = dataset;
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn set_cookie(&mut self, name: &str, value: &str) {
        self.cookies.insert(name.to_string(), value.to_string());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn session(&self) -> Option<&Arc<dyn SessionStore>> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.session_id())
    }

    pub fn set_session(&mut self, session: Option<Arc<dyn SessionStore>>) {
        self.session = session;
    }

    pub fn input_document(&self) -> Option<&[u8]> {
        self.input_document.as_deref()
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    pub fn take_response(&mut self) -> Response {
        std::mem::take(&mut self.response)
    }

    pub fn cached_access(&self, application_id: ApplicationId) -> Option<AccessLevel> {
        self.cached_access
            .filter(|(id, _)| *id == application_id)
            .map(|(_, level)| level)
    }

    pub fn cache_access(&mut self, application_id: ApplicationId, level: AccessLevel) {
        self.cached_access = Some((application_id, level));
    }

    pub fn is_cache_eligible(&self) -> bool {
        self.cache_eligible
    }

    pub fn mark_cache_eligible(&mut self) {
        self.cache_eligible = true;
    }
}

impl ParameterStore for Request {
    fn parameter(&self, name: &str) -> Option<&str> {
        self.params.parameter(name)
    }

    fn parameter_values(&self, name: &str) -> &[String] {
        self.params.parameter_values(name)
    }

    fn set_parameter(&mut self, name: &str, value: String) {
        self.params.set_parameter(name, value);
    }

    fn append_parameter(&mut self, name: &str, value: String) {
        self.params.append_parameter(name, value);
    }

    fn remove_parameter(&mut self, name: &str) -> Option<Vec<String>> {
        self.params.remove_parameter(name)
    }
}

pub fn strip_extension(page: &str) -> &str {
    match page.rfind('.') {
        Some(idx) if idx > 0 => &page[..idx],
        _ => page,
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MissingField(&'static str),
    InvalidRange(&'static str),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "missing field '{field}'"),
            Self::InvalidRange(field) => write!(f, "field '{field}' is out of range"),
        }
    }
}

impl std::error::Error for ValidationError {}

pub fn validate_application(application: &ApplicationDefinition) -> Result<(), ValidationError> {
    if application.name.trim().is_empty() {
        return Err(ValidationError::MissingField("name"));
    }
    if application.request_root.trim_matches('/').trim().is_empty() {
        return Err(ValidationError::MissingField("request_root"));
    }
    if application.max_threads == 0 {
        return Err(ValidationError::InvalidRange("max_threads"));
    }
    if application.request_types.parameter.trim().is_empty() {
        return Err(ValidationError::MissingField("request_types.parameter"));
    }
    for dataset in &application.datasets {
        validate_dataset(dataset)?;
    }
    Ok(())
}

pub fn validate_dataset(dataset: &DatasetDefinition) -> Result<(), ValidationError> {
    if dataset.name.trim().is_empty() {
        return Err(ValidationError::MissingField("datasets[].name"));
    }
    if dataset.page.trim().is_empty() {
        return Err(ValidationError::MissingField("datasets[].page"));
    }
    if dataset.handler.trim().is_empty() {
        return Err(ValidationError::MissingField("datasets[].handler"));
    }
    for condition in &dataset.selector {
        if condition.parameter.trim().is_empty() {
            return Err(ValidationError::MissingField("datasets[].selector[].parameter"));
        }
    }
    for extension in &dataset.extensions {
        if extension.name.trim().is_empty() {
            return Err(ValidationError::MissingField("datasets[].extensions[].name"));
        }
    }
    Ok(())
}
