#![allow(dead_code)]

use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;

/// A gzip'd tarball holding `(path, contents, mode)` entries.
pub fn bundle(files: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data, mode) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    let tar = builder.into_inner().unwrap();

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&tar).unwrap();
    gz.finish().unwrap()
}

/// A minimal valid bundle; `tag` makes its digest unique.
pub fn tool_bundle(tag: &str) -> Vec<u8> {
    let script = format!("#!/bin/sh\necho {tag}\n");
    bundle(&[
        ("bin/kubectl", script.as_bytes(), 0o755),
        ("bin/aux/ipset", b"#!/bin/sh\n", 0o755),
    ])
}
