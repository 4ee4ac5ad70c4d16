//! API constants for Microsoft Graph

use url::Url;

/// Microsoft Graph host
pub const GRAPH_HOST: &str = "https://graph.microsoft.com";

/// Graph API version
pub const API_VERSION: &str = "v1.0";

/// Full versioned base URL
pub fn graph_base_url() -> String {
    format!("{}/{}", GRAPH_HOST, API_VERSION)
}

/// Largest page size Graph accepts for directory objects
pub const MAX_PAGE_SIZE: &str = "999";

/// Periods accepted by the usage report functions
pub const REPORT_PERIODS: &[&str] = &["D7", "D30", "D90", "D180"];

/// Standard headers for Graph requests
pub mod headers {
    pub const CONTENT_TYPE_JSON: &str = "application/json";

    /// Client-side request id, echoed back by Graph
    pub const CLIENT_REQUEST_ID: &str = "client-request-id";
}

/// OData keys found in collection responses
pub mod odata {
    pub const VALUE: &str = "value";
    pub const NEXT_LINK: &str = "@odata.nextLink";
}

pub mod endpoints {
    pub const USERS: &str = "users";
    pub const GROUPS: &str = "groups";
    pub const SUBSCRIBED_SKUS: &str = "subscribedSkus";
}

/// Join an endpoint onto a base URL. Absolute URLs pass through unchanged.
pub fn endpoint_url(base_url: &str, endpoint: &str) -> String {
    if endpoint.starts_with("https://") || endpoint.starts_with("http://") {
        return endpoint.to_string();
    }
    format!("{}/{}", base_url.trim_end_matches('/'), endpoint.trim_start_matches('/'))
}

/// Whether `link` points at the same scheme, host and port as `base_url`.
/// Relative links always do.
pub fn same_origin(base_url: &str, link: &str) -> bool {
    if !(link.starts_with("https://") || link.starts_with("http://")) {
        return true;
    }
    match (Url::parse(base_url), Url::parse(link)) {
        (Ok(base), Ok(link)) => base.origin() == link.origin(),
        _ => false,
    }
}

/// Build a usage report function endpoint, e.g. `reports/getOffice365ActiveUserDetail(period='D7')`
pub fn report_endpoint(report: &str, period: &str) -> String {
    format!("reports/{}(period='{}')", report, period)
}
