use std::env;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use tar::Archive;
use walkdir::WalkDir;
use zip::read::ZipArchive;

const PDFIUM_RELEASE: &str = "chromium/7350";
const RELEASES_URL: &str = "https://github.com/bblanchon/pdfium-binaries/releases/download";

const WATCHED_ENV: &[&str] = &[
    "PRESENTER_PDFIUM_SKIP_DOWNLOAD",
    "PRESENTER_PDFIUM_ARCHIVE",
    "PRESENTER_PDFIUM_RELEASE",
    "PRESENTER_PDFIUM_PLATFORM",
    "PRESENTER_PDFIUM_BASE_URL",
    "PDFIUM_DYNAMIC_LIB_PATH",
    "PDFIUM_STATIC_LIB_PATH",
];

/// Where the pdfium shared library comes from for this build.
struct PdfiumSource {
    release: String,
    base_url: String,
    platform: String,
    archive: Option<PathBuf>,
    library_names: &'static [&'static str],
}

impl PdfiumSource {
    fn from_env() -> Result<Self> {
        let os = env::var("CARGO_CFG_TARGET_OS").context("CARGO_CFG_TARGET_OS not set")?;
        let arch = env::var("CARGO_CFG_TARGET_ARCH").context("CARGO_CFG_TARGET_ARCH not set")?;
        let library_names: &'static [&'static str] = match os.as_str() {
            "windows" => &["pdfium.dll"],
            "macos" => &["libpdfium.dylib"],
            _ => &["libpdfium.so"],
        };

        Ok(Self {
            release: env::var("PRESENTER_PDFIUM_RELEASE")
                .unwrap_or_else(|_| PDFIUM_RELEASE.to_string()),
            base_url: env::var("PRESENTER_PDFIUM_BASE_URL")
                .unwrap_or_else(|_| RELEASES_URL.to_string()),
            platform: env::var("PRESENTER_PDFIUM_PLATFORM")
                .unwrap_or_else(|_| platform_name(&os, &arch)),
            archive: env::var_os("PRESENTER_PDFIUM_ARCHIVE").map(PathBuf::from),
            library_names,
        })
    }

    fn find_library(&self, root: &Path) -> Option<PathBuf> {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .find(|entry| {
                let name = entry.file_name().to_string_lossy();
                self.library_names.iter().any(|candidate| *candidate == name)
            })
            .map(|entry| entry.into_path())
    }

    fn fetch_archive(&self, staging: &Path) -> Result<PathBuf> {
        if let Some(archive) = &self.archive {
            return Ok(archive.clone());
        }

        let downloads = staging.join("downloads");
        fs::create_dir_all(&downloads).context("failed to create download directory")?;
        let agent = ureq::AgentBuilder::new()
            .timeout_read(Duration::from_secs(120))
            .build();

        let mut failures = Vec::new();
        for extension in ["tgz", "zip"] {
            let file_name = format!("pdfium-{}.{}", self.platform, extension);
            let destination = downloads.join(&file_name);
            if destination.exists() {
                return Ok(destination);
            }
            let url = format!(
                "{}/{}/{}",
                self.base_url.trim_end_matches('/'),
                self.release.trim_matches('/'),
                file_name
            );
            match download(&agent, &url, &destination) {
                Ok(()) => return Ok(destination),
                Err(err) => failures.push(format!("{err:#}")),
            }
        }

        Err(anyhow!(
            "could not download pdfium {} for {}: {}",
            self.release,
            self.platform,
            failures.join("; ")
        ))
    }
}

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=build.rs");
    for var in WATCHED_ENV {
        println!("cargo:rerun-if-env-changed={var}");
    }

    if env::var_os("CARGO_FEATURE_PDF").is_none()
        || env::var_os("PRESENTER_PDFIUM_SKIP_DOWNLOAD").is_some()
        || env::var_os("PDFIUM_DYNAMIC_LIB_PATH").is_some()
        || env::var_os("PDFIUM_STATIC_LIB_PATH").is_some()
    {
        return Ok(());
    }

    let source = PdfiumSource::from_env()?;
    let staging = PathBuf::from(env::var("OUT_DIR").context("OUT_DIR not set")?).join("pdfium");
    fs::create_dir_all(&staging).context("failed to create pdfium staging directory")?;

    let library = match source.find_library(&staging) {
        Some(library) => library,
        None => {
            let archive = source.fetch_archive(&staging)?;
            unpack(&archive, &staging.join("lib"))?;
            source
                .find_library(&staging)
                .with_context(|| format!("no pdfium library inside {:?}", archive))?
        }
    };

    let library = library
        .to_str()
        .ok_or_else(|| anyhow!("pdfium path {:?} is not UTF-8", library))?;
    println!("cargo:rustc-env=PRESENTER_PDFIUM_LIBRARY_PATH={library}");
    Ok(())
}

fn platform_name(os: &str, arch: &str) -> String {
    let os = match os {
        "macos" => "mac",
        other => other,
    };
    let arch = match arch {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("{os}-{arch}")
}

fn download(agent: &ureq::Agent, url: &str, destination: &Path) -> Result<()> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("GET {url} failed"))?;
    let partial = destination.with_extension("part");
    let mut file =
        File::create(&partial).with_context(|| format!("failed to create {:?}", partial))?;
    io::copy(&mut response.into_reader(), &mut file)
        .with_context(|| format!("failed to write {:?}", partial))?;
    fs::rename(&partial, destination)?;
    Ok(())
}

fn unpack(archive: &Path, destination: &Path) -> Result<()> {
    if destination.exists() {
        fs::remove_dir_all(destination)
            .with_context(|| format!("failed to clear {:?}", destination))?;
    }
    fs::create_dir_all(destination)?;

    let file = File::open(archive).with_context(|| format!("failed to open {:?}", archive))?;
    match archive.extension().and_then(|ext| ext.to_str()) {
        Some("tgz") | Some("gz") => Archive::new(GzDecoder::new(file))
            .unpack(destination)
            .with_context(|| format!("failed to unpack {:?}", archive))?,
        Some("zip") => ZipArchive::new(file)
            .and_then(|mut zip| zip.extract(destination))
            .with_context(|| format!("failed to extract {:?}", archive))?,
        _ => bail!("unsupported pdfium archive {:?}", archive),
    }
    Ok(())
}
