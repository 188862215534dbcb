use std::path::Path;

use fcgiwrap::{resolve_script, Params, ScriptError, ScriptPolicy, WorkDir};

mod support;
use support::write_script;

fn params(pairs: &[(&str, &str)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn s(p: &Path) -> &str {
    p.to_str().unwrap()
}

#[test]
fn test_script_name_under_document_root() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir(root.join("cgi-bin")).unwrap();
    let script = write_script(&root.join("cgi-bin"), "ok.cgi", "exit 0");

    let d = resolve_script(
        &params(&[("DOCUMENT_ROOT", s(root)), ("SCRIPT_NAME", "/cgi-bin/ok.cgi")]),
        ScriptPolicy::default(),
    )
    .unwrap();
    assert_eq!(d.path, script);
    assert_eq!(d.workdir, WorkDir::Path(root.join("cgi-bin")));
}

#[test]
fn test_missing_parameters() {
    let err = resolve_script(&params(&[("SCRIPT_NAME", "/x.cgi")]), ScriptPolicy::default())
        .unwrap_err();
    assert!(err.to_string().contains("missing document root"), "{err}");

    let err = resolve_script(&params(&[("DOCUMENT_ROOT", "/srv/www")]), ScriptPolicy::default())
        .unwrap_err();
    assert!(err.to_string().contains("missing script name"), "{err}");

    // empty counts as missing
    let err = resolve_script(
        &params(&[("DOCUMENT_ROOT", ""), ("SCRIPT_NAME", "/x.cgi")]),
        ScriptPolicy::default(),
    )
    .unwrap_err();
    assert!(matches!(err, ScriptError::MissingDocumentRoot));
}

#[test]
fn test_traversal_outside_root_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("www");
    std::fs::create_dir(&root).unwrap();
    write_script(dir.path(), "evil.cgi", "exit 0");

    let err = resolve_script(
        &params(&[("DOCUMENT_ROOT", s(&root)), ("SCRIPT_NAME", "/../evil.cgi")]),
        ScriptPolicy::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("outside document root"), "{err}");

    let evil = dir.path().join("evil.cgi");
    let err = resolve_script(
        &params(&[("DOCUMENT_ROOT", s(&root)), ("SCRIPT_FILENAME", s(&evil))]),
        ScriptPolicy::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("outside document root"), "{err}");
}

#[test]
fn test_dotdot_that_stays_inside_root_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir(root.join("a")).unwrap();
    let script = write_script(root, "x.cgi", "exit 0");

    let d = resolve_script(
        &params(&[("DOCUMENT_ROOT", s(root)), ("SCRIPT_NAME", "/a/../x.cgi")]),
        ScriptPolicy::default(),
    )
    .unwrap();
    assert_eq!(d.path, script);
    assert_eq!(d.workdir, WorkDir::Path(root.to_path_buf()));
}

#[test]
fn test_relative_paths_rejected() {
    let err = resolve_script(
        &params(&[("DOCUMENT_ROOT", "/srv/www"), ("SCRIPT_FILENAME", "x.cgi")]),
        ScriptPolicy::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("must be absolute"), "{err}");

    let err = resolve_script(
        &params(&[("DOCUMENT_ROOT", "srv/www"), ("SCRIPT_FILENAME", "/srv/www/x.cgi")]),
        ScriptPolicy::default(),
    )
    .unwrap_err();
    assert!(matches!(err, ScriptError::RelativeDocumentRoot(_)), "{err}");
}

#[test]
fn test_file_type_checks() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let target = write_script(root, "real.cgi", "exit 0");
    std::os::unix::fs::symlink(&target, root.join("link.cgi")).unwrap();
    std::fs::create_dir(root.join("dir.cgi")).unwrap();
    std::fs::write(root.join("plain.cgi"), "#!/bin/sh\n").unwrap();

    let cases = [
        ("/link.cgi", "symlinks unsupported"),
        ("/dir.cgi", "not a regular file"),
        ("/plain.cgi", "not executable"),
        ("/absent.cgi", "not found"),
    ];
    for (name, phrase) in cases {
        let err = resolve_script(
            &params(&[("DOCUMENT_ROOT", s(root)), ("SCRIPT_NAME", name)]),
            ScriptPolicy::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains(phrase), "{name}: {err}");
    }
}

#[test]
fn test_fcgi_chdir() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_script(root, "x.cgi", "exit 0");
    let work = root.join("work");
    std::fs::create_dir(&work).unwrap();
    let base = [("DOCUMENT_ROOT", s(root)), ("SCRIPT_NAME", "/x.cgi")];

    let with = |chdir: &str| {
        let mut p = params(&base);
        p.insert("FCGI_CHDIR".to_string(), chdir.to_string());
        resolve_script(&p, ScriptPolicy::default())
    };

    assert_eq!(with(s(&work)).unwrap().workdir, WorkDir::Path(work.clone()));
    assert_eq!(with("-").unwrap().workdir, WorkDir::Inherit);
    assert!(with("work").unwrap_err().to_string().contains("must be absolute"));
    assert!(with(s(&root.join("x.cgi")))
        .unwrap_err()
        .to_string()
        .contains("not a directory"));
    assert!(matches!(
        with(s(&root.join("missing"))).unwrap_err(),
        ScriptError::ChdirInspect { .. }
    ));
}

#[test]
fn test_unrooted_script_filename_needs_opt_in() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "x.cgi", "exit 0");
    let p = params(&[("SCRIPT_FILENAME", s(&script))]);

    let err = resolve_script(&p, ScriptPolicy::default()).unwrap_err();
    assert!(err.to_string().contains("missing document root"), "{err}");

    let d = resolve_script(&p, ScriptPolicy { allow_unrooted: true }).unwrap();
    assert_eq!(d.path, script);
}

#[test]
fn test_script_filename_wins_over_script_name() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let chosen = write_script(root, "chosen.cgi", "exit 0");
    let d = resolve_script(
        &params(&[
            ("DOCUMENT_ROOT", s(root)),
            ("SCRIPT_NAME", "/does-not-exist.cgi"),
            ("SCRIPT_FILENAME", s(&chosen)),
        ]),
        ScriptPolicy::default(),
    )
    .unwrap();
    assert_eq!(d.path, chosen);
}
