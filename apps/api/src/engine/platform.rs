//! ATS platform detection.
//!
//! Recipes are keyed by platform, so every execution starts by resolving
//! the apply URL's host to a platform name. Known hosted-ATS domains are
//! matched structurally; anything else falls back to the aggregator's
//! `ats_type` tag. Results are memoized per host in a bounded cache
//! injected by the caller, since the same handful of ATS hosts dominates
//! real traffic.

use std::sync::Mutex;

use url::Url;

use crate::cache::BoundedCache;

/// Hosted-ATS domains and the platform key their recipes are stored under.
const PLATFORM_DOMAINS: &[(&str, &str)] = &[
    ("greenhouse.io", "GREENHOUSE"),
    ("lever.co", "LEVER"),
    ("myworkdayjobs.com", "WORKDAY"),
    ("ashbyhq.com", "ASHBY"),
    ("smartrecruiters.com", "SMARTRECRUITERS"),
    ("workable.com", "WORKABLE"),
    ("jobvite.com", "JOBVITE"),
    ("icims.com", "ICIMS"),
    ("bamboohr.com", "BAMBOOHR"),
    ("teamtailor.com", "TEAMTAILOR"),
    ("breezy.hr", "BREEZY"),
    ("recruitee.com", "RECRUITEE"),
];

/// Maps a lowercase host to a platform key, matching the registered domain
/// itself or any subdomain of it.
pub fn platform_for_host(host: &str) -> Option<&'static str> {
    PLATFORM_DOMAINS.iter().find_map(|(domain, platform)| {
        let matches = host == *domain || host.ends_with(&format!(".{domain}"));
        matches.then_some(*platform)
    })
}

/// Resolves the platform key for an apply URL, consulting the host cache
/// first. Unknown or unparseable hosts fall back to the job's `ats_type`.
pub fn detect_platform(
    cache: &Mutex<BoundedCache<String, String>>,
    apply_url: &str,
    ats_type: &str,
) -> String {
    let fallback = ats_type.trim().to_ascii_uppercase();

    let host = match Url::parse(apply_url).ok().and_then(|u| {
        u.host_str().map(|h| h.to_ascii_lowercase())
    }) {
        Some(host) => host,
        None => return fallback,
    };

    let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(platform) = cache.get(&host) {
        return platform.clone();
    }

    let platform = platform_for_host(&host)
        .map(str::to_string)
        .unwrap_or(fallback);
    cache.insert(host, platform.clone());
    platform
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> Mutex<BoundedCache<String, String>> {
        Mutex::new(BoundedCache::new(16))
    }

    #[test]
    fn test_known_hosts_resolve() {
        assert_eq!(platform_for_host("greenhouse.io"), Some("GREENHOUSE"));
        assert_eq!(platform_for_host("boards.greenhouse.io"), Some("GREENHOUSE"));
        assert_eq!(platform_for_host("jobs.lever.co"), Some("LEVER"));
        assert_eq!(
            platform_for_host("acme.wd5.myworkdayjobs.com"),
            Some("WORKDAY")
        );
        assert_eq!(platform_for_host("careers.example.com"), None);
    }

    #[test]
    fn test_lookalike_host_does_not_match() {
        assert_eq!(platform_for_host("evilgreenhouse.io"), None);
        assert_eq!(platform_for_host("greenhouse.io.evil.com"), None);
    }

    #[test]
    fn test_detect_uses_structural_match_over_tag() {
        let cache = cache();
        let platform = detect_platform(
            &cache,
            "https://boards.greenhouse.io/acme/jobs/42",
            "UNKNOWN",
        );
        assert_eq!(platform, "GREENHOUSE");
    }

    #[test]
    fn test_detect_falls_back_to_ats_type() {
        let cache = cache();
        let platform = detect_platform(&cache, "https://careers.acme.com/apply", "custom");
        assert_eq!(platform, "CUSTOM");
    }

    #[test]
    fn test_detect_handles_unparseable_url() {
        let cache = cache();
        assert_eq!(detect_platform(&cache, "not a url", "lever"), "LEVER");
        // Nothing cacheable without a host.
        assert!(cache.lock().unwrap().is_empty());
    }

    #[test]
    fn test_detect_memoizes_per_host() {
        let cache = cache();
        detect_platform(&cache, "https://jobs.lever.co/acme/1", "X");
        detect_platform(&cache, "https://jobs.lever.co/acme/2", "X");
        assert_eq!(cache.lock().unwrap().len(), 1);
        assert_eq!(
            cache.lock().unwrap().get(&"jobs.lever.co".to_string()),
            Some(&"LEVER".to_string())
        );
    }
}
