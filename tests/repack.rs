mod common;

use anyhow::Result;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use binject::backend::{backend_for, InjectBatch, Resource};
use binject::container::{self, CacheKeyHash, PlatformMetadata};
use binject::context::Context;
use binject::error::{exit_code, FILE_NOT_FOUND, INVALID_ARGS, INVALID_FORMAT, SECTION_NOT_FOUND};
use binject::format::Format;
use binject::inject::{extract, inject_file, list, verify, InjectOptions, VfsSource};
use binject::records::{UpdateConfig, VfsConfig, VfsMode};
use binject::repack::{probe, repack, RepackRequest};

use common::{macho_image, pe_image, static_elf};

const PAYLOAD: [u8; 100] = [0x5c; 100];

fn write(dir: &TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, data).unwrap();
    path
}

fn repack_file(ctx: &Context, stub: &Path, payload: &Path, output: &Path, update: Option<UpdateConfig>) -> Result<()> {
    let request = RepackRequest {
        stub,
        payload,
        uncompressed_size: 1000,
        platform: PlatformMetadata::host(),
        update_config: update,
        output,
    };
    repack(ctx, &request)?;
    Ok(())
}

#[test]
fn repacked_stub_verifies_and_extracts() -> Result<()> {
    let dir = TempDir::new()?;
    let ctx = Context::default();
    let stub = write(&dir, "stub", &static_elf());
    let payload = write(&dir, "payload.bin", &PAYLOAD);
    let out = dir.path().join("out");

    let request = RepackRequest {
        stub: &stub,
        payload: &payload,
        uncompressed_size: 1000,
        platform: PlatformMetadata::host(),
        update_config: None,
        output: &out,
    };
    let report = repack(&ctx, &request)?;
    assert_eq!(report.format, Format::Elf);
    assert_eq!(report.cache_key, container::cache_key(&PAYLOAD, CacheKeyHash::Fnv1a));
    assert_eq!(report.container_size, container::encode_len(PAYLOAD.len(), false));
    assert_eq!(report.output_size as u64, fs::metadata(&out)?.len());
    let image = fs::read(&out)?;
    assert_eq!(&image[32..40], &64u64.to_le_bytes(), "e_phoff moved");

    let verified = verify(&out, Resource::Pressed)?;
    assert_eq!(verified.cache_key.as_deref(), Some(report.cache_key.as_str()));
    assert_eq!(verified.size, report.container_size);

    let extracted = dir.path().join("container.bin");
    let written = extract(&out, Resource::Pressed, &extracted)?;
    let bytes = fs::read(&extracted)?;
    assert_eq!(written, bytes.len());
    let found = container::decode(&bytes)?.unwrap();
    assert_eq!(found.offset, 0);
    assert_eq!(found.payload, &PAYLOAD[..]);
    assert_eq!(found.uncompressed_size, 1000);
    assert!(found.update_config.is_none());
    Ok(())
}

#[test]
fn update_config_travels_with_the_container() -> Result<()> {
    let dir = TempDir::new()?;
    let ctx = Context::default();
    let stub = write(&dir, "stub", &macho_image(true));
    let payload = write(&dir, "payload.bin", &PAYLOAD);
    let out = dir.path().join("out");
    let update = UpdateConfig {
        url: "https://updates.example.test/app".into(),
        binname: "app".into(),
        ..Default::default()
    };
    repack_file(&ctx, &stub, &payload, &out, Some(update.clone()))?;

    let image = fs::read(&out)?;
    let found = probe(&image)?.unwrap();
    assert_eq!(found.update_config, Some(update));
    assert_eq!(found.payload, &PAYLOAD[..]);
    Ok(())
}

#[test]
fn repacking_a_repacked_stub_is_stable() -> Result<()> {
    let ctx = Context::default();
    for stub_image in [static_elf(), macho_image(true), pe_image()] {
        let dir = TempDir::new()?;
        let stub = write(&dir, "stub", &stub_image);
        let payload = write(&dir, "payload.bin", &PAYLOAD);
        let once = dir.path().join("once");
        let twice = dir.path().join("twice");

        repack_file(&ctx, &stub, &payload, &once, None)?;
        repack_file(&ctx, &once, &payload, &twice, None)?;
        assert_eq!(fs::read(&once)?, fs::read(&twice)?);
    }
    Ok(())
}

#[test]
fn uncompressed_binaries_have_no_container() -> Result<()> {
    assert!(probe(&static_elf())?.is_none());
    assert!(probe(&macho_image(false))?.is_none());
    assert!(probe(&pe_image())?.is_none());
    assert!(probe(b"plain text")?.is_none());
    Ok(())
}

#[test]
fn error_codes() -> Result<()> {
    let dir = TempDir::new()?;
    let missing = dir.path().join("missing");
    assert_eq!(exit_code(&list(&missing).unwrap_err()), FILE_NOT_FOUND);

    let text = write(&dir, "notes.txt", b"hello, not a binary");
    assert_eq!(exit_code(&list(&text).unwrap_err()), INVALID_FORMAT);

    let elf = write(&dir, "plain", &static_elf());
    assert_eq!(exit_code(&verify(&elf, Resource::Sea).unwrap_err()), SECTION_NOT_FOUND);
    assert_eq!(exit_code(&verify(&elf, Resource::Pressed).unwrap_err()), SECTION_NOT_FOUND);

    let ctx = Context::default();
    let payload = dir.path().join("no-payload");
    let err = repack_file(&ctx, &elf, &payload, &dir.path().join("out"), None).unwrap_err();
    assert_eq!(exit_code(&err), FILE_NOT_FOUND);
    Ok(())
}

#[test]
fn inject_writes_and_lists() -> Result<()> {
    let dir = TempDir::new()?;
    let ctx = Context::default();
    let exe = write(&dir, "node", &static_elf());
    let sea = write(&dir, "app.blob", b"sea application");
    let out = dir.path().join("app");

    let options = InjectOptions {
        sea: Some(sea),
        vfs: Some(VfsSource::Compat),
        ..Default::default()
    };
    let report = inject_file(&ctx, &exe, &out, &options)?;
    assert_eq!(report.format, Format::Elf);
    let kinds: Vec<_> = report.injected.iter().map(|(r, _)| *r).collect();
    assert_eq!(kinds, [Resource::Sea, Resource::Vfs, Resource::VfsConfig]);

    let (format, found) = list(&out)?;
    assert_eq!(format, Format::Elf);
    assert_eq!(found.len(), 3);
    assert_eq!(found[0].size, 15);
    assert_eq!(found[1].size, 0);
    // An empty VFS blob is how compat mode advertises itself.
    assert_eq!(verify(&out, Resource::Vfs)?.size, 0);
    let config = verify(&out, Resource::VfsConfig)?.vfs_config.unwrap();
    assert_eq!(config.mode, VfsMode::Compat);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(fs::metadata(&out)?.permissions().mode() & 0o777, 0o755);
    }
    Ok(())
}

#[test]
fn empty_blobs_are_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let exe = write(&dir, "node", &static_elf());
    let sea = write(&dir, "empty.blob", b"");
    let options = InjectOptions {
        sea: Some(sea),
        ..Default::default()
    };
    let err = inject_file(&Context::default(), &exe, &dir.path().join("out"), &options).unwrap_err();
    assert_eq!(exit_code(&err), INVALID_ARGS);
    assert!(!dir.path().join("out").exists());
    Ok(())
}

#[test]
fn compressed_stubs_need_skip_repack() -> Result<()> {
    let dir = TempDir::new()?;
    let ctx = Context::default();
    let stub = write(&dir, "stub", &static_elf());
    let payload = write(&dir, "payload.bin", &PAYLOAD);
    let packed = dir.path().join("packed");
    repack_file(&ctx, &stub, &payload, &packed, None)?;

    let sea = write(&dir, "app.blob", b"sea");
    let out = dir.path().join("out");
    let mut options = InjectOptions {
        sea: Some(sea),
        ..Default::default()
    };
    let err = inject_file(&ctx, &packed, &out, &options).unwrap_err();
    assert_eq!(exit_code(&err), INVALID_ARGS);
    assert!(format!("{err:#}").contains("--skip-repack"));

    options.skip_repack = true;
    inject_file(&ctx, &packed, &out, &options)?;
    assert_eq!(verify(&out, Resource::Sea)?.size, 3);
    assert!(verify(&out, Resource::Pressed)?.cache_key.is_some());
    Ok(())
}

#[test]
fn containers_grow_and_shrink_in_place() -> Result<()> {
    let ctx = Context::default();
    for stub_image in [static_elf(), macho_image(true), pe_image()] {
        let dir = TempDir::new()?;
        let stub = write(&dir, "stub", &stub_image);
        let mut current = stub.clone();
        for (step, len) in [100usize, 70000, 10].into_iter().enumerate() {
            let payload_bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let payload = write(&dir, &format!("payload-{step}"), &payload_bytes);
            let out = dir.path().join(format!("out-{step}"));
            repack_file(&ctx, &current, &payload, &out, None)?;

            let image = fs::read(&out)?;
            let found = probe(&image)?.unwrap();
            assert_eq!(found.payload, &payload_bytes[..]);
            assert_eq!(found.cache_key, container::cache_key(&payload_bytes, CacheKeyHash::Fnv1a));
            let (_, listed) = list(&out)?;
            assert_eq!(listed.iter().filter(|r| r.resource == Resource::Pressed).count(), 1);
            current = out;
        }

        // Shrinking back lands on the same bytes as packing the small payload directly.
        let direct = dir.path().join("direct");
        repack_file(&ctx, &stub, &dir.path().join("payload-2"), &direct, None)?;
        assert_eq!(fs::read(&current)?, fs::read(&direct)?);
    }
    Ok(())
}

#[test]
fn vfs_config_with_a_future_version_fails_verification() -> Result<()> {
    let dir = TempDir::new()?;
    let mut record = VfsConfig::default().to_bytes()?;
    record[4] = 9;
    let batch = InjectBatch {
        sea: Some(&b"sea"[..]),
        vfs: Some(&b""[..]),
        vfs_config: Some(&record[..]),
    };
    let image = backend_for(Format::Elf)?.inject(static_elf(), &batch)?;
    let exe = write(&dir, "app", &image);
    let err = verify(&exe, Resource::VfsConfig).unwrap_err();
    assert_eq!(exit_code(&err), INVALID_FORMAT);
    Ok(())
}
