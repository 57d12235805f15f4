// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wheel archive adapter behavior: unpacking, tag rewriting, RECORD
//! regeneration, and deterministic repacking.

use linux_wheel_auditor::{
    audit::analyze_wheel,
    elf::Libc,
    error::AuditError,
    policy::PolicySet,
    resolver::Resolver,
    testutil::{build_wheel, WheelEntry},
    wheel::UnpackedWheel,
};

#[test]
fn pure_wheel_has_no_elf_and_is_non_platform() {
    let dir = tempfile::tempdir().unwrap();
    let wheel_path = build_wheel(
        dir.path(),
        "purepkg-1.0-py3-none-any.whl",
        vec![
            WheelEntry::new("purepkg/__init__.py", b"VERSION = \"1.0\"\n".to_vec()),
            WheelEntry::new("purepkg/util.py", b"def f():\n    return 1\n".to_vec()),
        ],
    );

    let wheel = UnpackedWheel::unpack(&wheel_path).unwrap();
    assert!(wheel.elf_files().unwrap().is_empty());

    let policies = PolicySet::load_default(
        Libc::Glibc,
        linux_wheel_auditor::arch::Architecture::X86_64,
        None,
    )
    .unwrap();
    let resolver = Resolver::default().with_trusted_dirs(vec![]);

    let err = analyze_wheel(&wheel, &policies, &resolver, &[], true).unwrap_err();
    assert!(matches!(err, AuditError::NonPlatformWheel));
}

#[test]
fn record_rewrite_contains_digests() {
    let dir = tempfile::tempdir().unwrap();
    let wheel_path = build_wheel(
        dir.path(),
        "demo-1.0-py3-none-any.whl",
        vec![WheelEntry::new("demo/__init__.py", b"x = 1\n".to_vec())],
    );

    let wheel = UnpackedWheel::unpack(&wheel_path).unwrap();
    wheel.rewrite_record().unwrap();

    let record =
        std::fs::read_to_string(wheel.root().join("demo-1.0.dist-info/RECORD")).unwrap();

    // sha256("x = 1\n") in urlsafe base64 without padding.
    let mut found_init = false;
    for line in record.lines() {
        if line.starts_with("demo/__init__.py,sha256=") {
            found_init = true;
            assert!(line.ends_with(",6"), "length field wrong: {}", line);
        }
    }
    assert!(found_init, "RECORD lacks digest row: {}", record);
    assert!(record.contains("demo-1.0.dist-info/RECORD,,"));
}

#[test]
fn record_rewrite_removes_signature() {
    let dir = tempfile::tempdir().unwrap();
    let wheel_path = build_wheel(
        dir.path(),
        "demo-1.0-py3-none-any.whl",
        vec![WheelEntry::new(
            "demo-1.0.dist-info/RECORD.jws",
            b"{}".to_vec(),
        )],
    );

    let wheel = UnpackedWheel::unpack(&wheel_path).unwrap();
    wheel.rewrite_record().unwrap();

    assert!(!wheel.root().join("demo-1.0.dist-info/RECORD.jws").exists());
}

#[test]
fn repack_is_deterministic_under_pinned_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let wheel_path = build_wheel(
        dir.path(),
        "demo-1.0-py3-none-any.whl",
        vec![
            WheelEntry::new("demo/__init__.py", b"x = 1\n".to_vec()),
            WheelEntry::new("demo/data.bin", vec![0u8; 256]).executable(),
        ],
    );

    let wheel = UnpackedWheel::unpack(&wheel_path).unwrap();
    wheel.rewrite_record().unwrap();

    let out_a = dir.path().join("a");
    let out_b = dir.path().join("b");
    std::fs::create_dir_all(&out_a).unwrap();
    std::fs::create_dir_all(&out_b).unwrap();

    let a = wheel
        .write_into_directory_with_timestamp(&out_a, Some(1_600_000_000))
        .unwrap();
    let b = wheel
        .write_into_directory_with_timestamp(&out_b, Some(1_600_000_000))
        .unwrap();

    assert_eq!(std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
}

#[test]
fn platform_tags_are_added_and_superseded() {
    let dir = tempfile::tempdir().unwrap();
    let wheel_path = build_wheel(
        dir.path(),
        "demo-1.0-cp310-cp310-linux_x86_64.whl",
        vec![WheelEntry::new("demo/__init__.py", Vec::new())],
    );

    let mut wheel = UnpackedWheel::unpack(&wheel_path).unwrap();
    wheel
        .add_platform_tags(
            &[
                "manylinux_2_17_x86_64".to_string(),
                "manylinux2014_x86_64".to_string(),
            ],
            &["linux_x86_64".to_string()],
        )
        .unwrap();

    // Sorted dot-join of surviving tags.
    assert_eq!(
        wheel.name.platform_tag,
        "manylinux2014_x86_64.manylinux_2_17_x86_64"
    );
    assert_eq!(
        wheel.name.file_name(),
        "demo-1.0-cp310-cp310-manylinux2014_x86_64.manylinux_2_17_x86_64.whl"
    );

    let metadata = wheel.wheel_metadata().unwrap();
    let tags = metadata.find_all("Tag");
    assert!(tags.contains(&"cp310-cp310-manylinux_2_17_x86_64"));
    assert!(tags.contains(&"cp310-cp310-manylinux2014_x86_64"));
    assert!(!tags.contains(&"cp310-cp310-linux_x86_64"));
}

#[test]
fn any_tag_is_displaced_by_platform_tags() {
    let dir = tempfile::tempdir().unwrap();
    let wheel_path = build_wheel(
        dir.path(),
        "demo-1.0-py3-none-any.whl",
        vec![WheelEntry::new("demo/__init__.py", Vec::new())],
    );

    let mut wheel = UnpackedWheel::unpack(&wheel_path).unwrap();
    wheel
        .add_platform_tags(&["manylinux_2_17_x86_64".to_string()], &[])
        .unwrap();

    assert_eq!(wheel.name.platform_tag, "manylinux_2_17_x86_64");

    let metadata = wheel.wheel_metadata().unwrap();
    assert_eq!(metadata.find_first("Root-Is-Purelib"), Some("false"));
    assert!(!metadata.find_all("Tag").contains(&"py3-none-any"));
}
