use std::path::{Component, Path, PathBuf};

use schema::Request;

use crate::{RouteError, RouteMatch, RouteTable};

/// What to do with a request no dataset claimed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackPolicy {
    pub application: String,
    pub request_root: String,
    pub default_page: Option<String>,
    pub static_root: Option<PathBuf>,
    pub document_root: Option<PathBuf>,
}

#[derive(Debug)]
pub enum RouteResolution<H> {
    Dataset(RouteMatch<H>),
    /// Redirect target, already prefixed with the request root.
    DefaultPage(String),
    StaticFile(PathBuf),
}

impl FallbackPolicy {
    pub fn fallback<H>(&self, request: &Request) -> Option<RouteResolution<H>> {
        let page = request.page_path().trim_matches('/');
        if page.is_empty() {
            return self
                .default_page
                .as_deref()
                .map(|target| target.trim_matches('/'))
                .filter(|target| !target.is_empty())
                .map(|target| {
                    RouteResolution::DefaultPage(format!(
                        "/{}/{}",
                        self.request_root.trim_matches('/'),
                        target
                    ))
                });
        }
        if !is_safe_relative_path(page) {
            return None;
        }

        if let Some(root) = &self.static_root {
            let candidate = root.join(page);
            if candidate.is_file() {
                return Some(RouteResolution::StaticFile(candidate));
            }
        }

        if request.page_extension().is_some()
            && let Some(document_root) = &self.document_root
        {
            let candidate = document_root
                .join(self.request_root.trim_matches('/'))
                .join(page);
            if candidate.is_file() {
                return Some(RouteResolution::StaticFile(candidate));
            }
        }
        None
    }
}

impl<H> RouteTable<H> {
    pub fn resolve_with_fallback(
        &self,
        request: &Request,
        policy: &FallbackPolicy,
    ) -> Result<RouteResolution<H>, RouteError> {
        if let Some(found) = self.resolve(request) {
            return Ok(RouteResolution::Dataset(found));
        }
        policy
            .fallback(request)
            .ok_or_else(|| RouteError::RouteNotFound {
                application: policy.application.clone(),
                path: format!("/{}/{}", request.request_root(), request.page_path()),
            })
    }
}

pub fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Route, Selector};
    use std::fs;

    fn policy(static_root: Option<PathBuf>, document_root: Option<PathBuf>) -> FallbackPolicy {
        FallbackPolicy {
            application: "catalog".to_string(),
            request_root: "catalog".to_string(),
            default_page: Some("index.html".to_string()),
            static_root,
            document_root,
        }
    }

    #[test]
    fn empty_page_redirects_to_default_page() {
        let table: RouteTable<()> = RouteTable::new();
        let resolved = table
            .resolve_with_fallback(&Request::new("catalog", ""), &policy(None, None))
            .expect("default page should apply");
        assert!(matches!(
            resolved,
            RouteResolution::DefaultPage(ref target) if target == "/catalog/index.html"
        ));
    }

    #[test]
    fn static_file_under_static_root_is_served() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("img")).unwrap();
        fs::write(dir.path().join("img/logo.png"), b"png").unwrap();

        let table: RouteTable<()> = RouteTable::new();
        let resolved = table
            .resolve_with_fallback(
                &Request::new("catalog", "img/logo.png"),
                &policy(Some(dir.path().to_path_buf()), None),
            )
            .unwrap();
        assert!(matches!(
            resolved,
            RouteResolution::StaticFile(ref path) if path.ends_with("img/logo.png")
        ));
    }

    #[test]
    fn bare_file_request_is_synthesized_under_document_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("catalog")).unwrap();
        fs::write(dir.path().join("catalog/readme.txt"), b"hello").unwrap();

        let table: RouteTable<()> = RouteTable::new();
        let resolved = table
            .resolve_with_fallback(
                &Request::new("catalog", "readme.txt"),
                &policy(None, Some(dir.path().to_path_buf())),
            )
            .unwrap();
        assert!(matches!(resolved, RouteResolution::StaticFile(_)));
    }

    #[test]
    fn unmatched_request_reports_application_and_path() {
        let table = RouteTable::new();
        table
            .add_route(Route::new(1, "Search", "search.xml", Selector::Always, ()))
            .unwrap();
        let err = table
            .resolve_with_fallback(&Request::new("catalog", "missing.xml"), &policy(None, None))
            .expect_err("nothing should match");
        assert_eq!(
            err,
            RouteError::RouteNotFound {
                application: "catalog".to_string(),
                path: "/catalog/missing.xml".to_string(),
            }
        );
    }

    #[test]
    fn parent_components_are_never_served() {
        let dir = tempfile::tempdir().unwrap();
        let table: RouteTable<()> = RouteTable::new();
        let outcome = table.resolve_with_fallback(
            &Request::new("catalog", "../secret.txt"),
            &policy(Some(dir.path().join("static")), Some(dir.path().to_path_buf())),
        );
        assert!(outcome.is_err());
        assert!(!is_safe_relative_path("a/../../b"));
        assert!(is_safe_relative_path("a/./b.txt"));
    }
}
