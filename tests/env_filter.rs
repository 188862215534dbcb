use std::ffi::OsStr;

use fcgiwrap::{is_inheritable, EnvironmentSet, InheritedEnv, Params, DENIED_INHERIT_NAMES};

#[test]
fn test_every_denied_name_is_dropped() {
    let mut host: Vec<(String, String)> = DENIED_INHERIT_NAMES
        .iter()
        .map(|n| (n.to_string(), "host".to_string()))
        .collect();
    host.push(("HOME".to_string(), "/home/www".to_string()));
    let inherited = InheritedEnv::from_vars(host);
    assert_eq!(inherited.len(), 1);
    assert_eq!(
        inherited.iter().next(),
        Some((OsStr::new("HOME"), OsStr::new("/home/www")))
    );
}

#[test]
fn test_http_prefix_is_a_plain_prefix() {
    for name in ["HTTP_HOST", "HTTP_PROXY", "HTTPS", "HTTPS_PROXY", "HTTP"] {
        assert!(!is_inheritable(OsStr::new(name)), "{name}");
    }
    for name in ["PATH", "LANG", "http_proxy", "XHTTP", "LD_DEBUG_OUTPUT"] {
        assert!(is_inheritable(OsStr::new(name)), "{name}");
    }
}

#[test]
fn test_merge_puts_request_first_without_duplicates() {
    let inherited = InheritedEnv::from_vars(vec![
        ("PATH", "/usr/bin"),
        ("TZ", "UTC"),
        ("LANG", "C"),
    ]);
    let mut params = Params::new();
    params.insert("TZ".to_string(), "Europe/Zurich".to_string());
    params.insert("SCRIPT_NAME".to_string(), "/x.cgi".to_string());
    params.insert("HTTP_HOST".to_string(), "example.org".to_string());

    let set = EnvironmentSet::merge(&params, &inherited);
    let names: Vec<String> = set
        .iter()
        .map(|(k, _)| k.to_string_lossy().into_owned())
        .collect();
    // request parameters (sorted) then inherited names not already present
    assert_eq!(names, vec!["HTTP_HOST", "SCRIPT_NAME", "TZ", "PATH", "LANG"]);
    assert_eq!(set.get("TZ"), Some(OsStr::new("Europe/Zurich")));
    // request-supplied HTTP_* is a CGI variable, not an inherited one
    assert_eq!(set.get("HTTP_HOST"), Some(OsStr::new("example.org")));
}

#[test]
fn test_empty_inputs() {
    let set = EnvironmentSet::merge(&Params::new(), &InheritedEnv::default());
    assert!(set.is_empty());
    assert!(set.to_strings().is_empty());
}
