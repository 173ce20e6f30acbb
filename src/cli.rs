use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{Error, ErrorKind, Result};
use crate::retry::RetryPolicy;
use crate::storage::ObjectLocation;
use crate::unzip::UnzipConfig;

const MIB: u64 = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "unzip-relay")]
#[command(version)]
#[command(about = "Extract a ZIP archive held in object storage back into object storage", long_about = None)]
#[command(after_help = "Examples:\n  \
  unzip-relay --source-bucket in --source-key a/b.zip --endpoint 'https://{bucket}.s3.{region}.example.com'\n  \
  unzip-relay --local-root ./buckets --source-bucket in --source-key b.zip --target-prefix out/\n  \
  unzip-relay -l -v --local-root ./buckets --source-bucket in --source-key b.zip")]
pub struct Cli {
    /// Bucket holding the archive
    #[arg(long, env = "SOURCE_BUCKET")]
    pub source_bucket: String,

    /// Region of the source bucket
    #[arg(long, env = "SOURCE_REGION", default_value = "")]
    pub source_region: String,

    /// Object key of the archive (must end in .zip)
    #[arg(long, env = "SOURCE_KEY")]
    pub source_key: String,

    /// Destination bucket (default: source bucket)
    #[arg(long, env = "TARGET_BUCKET")]
    pub target_bucket: Option<String>,

    /// Destination region (default: source region)
    #[arg(long, env = "TARGET_REGION")]
    pub target_region: Option<String>,

    /// Key prefix for extracted objects
    #[arg(long, env = "TARGET_PREFIX", default_value = "")]
    pub target_prefix: String,

    /// Nest extracted objects under the archive's base name
    #[arg(long, env = "EXTRA_ROOT_DIR")]
    pub extra_root_dir: bool,

    /// Do not create empty objects for directory entries
    #[arg(long, env = "SKIP_DIRECTORIES")]
    pub skip_directories: bool,

    /// Bucket URL template; `{bucket}` and `{region}` are substituted
    #[arg(long, env = "UNZIP_ENDPOINT", conflicts_with = "local_root")]
    pub endpoint: Option<String>,

    /// Extra request header, as `Name: value`
    #[arg(long, env = "UNZIP_AUTH_HEADER", requires = "endpoint")]
    pub auth_header: Option<String>,

    /// Serve buckets from subdirectories of this directory
    #[arg(long, env = "UNZIP_LOCAL_ROOT", value_name = "DIR")]
    pub local_root: Option<PathBuf>,

    /// Largest archive tail cached on local disk, in MiB
    #[arg(long, env = "LOCAL_SIZE_LIMIT", value_name = "MIB", default_value_t = 400)]
    pub local_size_limit: u64,

    /// Largest extracted object, in MiB
    #[arg(long, env = "MAX_FILE_SIZE", value_name = "MIB", default_value_t = 5 * 1024)]
    pub max_file_size: u64,

    /// Memory to size the batch from, in MiB (default: detected)
    #[arg(long, env = "MEMORY_MB")]
    pub memory_mb: Option<u64>,

    /// Working buffer assumed per upload, in MiB
    #[arg(long, env = "TASK_BUFFER_MB", default_value_t = 64)]
    pub task_buffer_mb: u64,

    /// Fraction of memory left unused
    #[arg(long, env = "RESERVE_RATE", default_value_t = 0.2)]
    pub reserve_rate: f64,

    /// Upper bound on concurrent uploads
    #[arg(long, env = "MAX_CONCURRENCY", default_value_t = 64)]
    pub max_concurrency: usize,

    /// Attempts for metadata, tail download and directory reads
    #[arg(long, env = "UNZIP_RETRY", default_value_t = RetryPolicy::DEFAULT_ATTEMPTS)]
    pub retry: u32,

    /// Pause between attempts, in milliseconds
    #[arg(long, env = "UNZIP_RETRY_DELAY_MS", default_value_t = 0)]
    pub retry_delay_ms: u64,

    /// Additional file name encodings to accept (comma separated)
    #[arg(long, env = "UNZIP_EXTRA_ENCODINGS", value_delimiter = ',')]
    pub extra_encodings: Vec<String>,

    /// Directory for the archive tail cache (default: system temp dir)
    #[arg(long, env = "UNZIP_CACHE_DIR", value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// List entries instead of extracting
    #[arg(short = 'l')]
    pub list: bool,

    /// Verbose listing and debug logging
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet > 0
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }

    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_directive(&self) -> &'static str {
        if self.is_very_quiet() {
            "error"
        } else if self.is_quiet() {
            "warn"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    pub fn source(&self) -> ObjectLocation {
        ObjectLocation::new(&*self.source_bucket, &*self.source_region, &*self.source_key)
    }

    /// Parse `--auth-header` into name and value.
    pub fn auth_header(&self) -> Result<Option<(&str, &str)>> {
        let Some(header) = self.auth_header.as_deref() else {
            return Ok(None);
        };
        match header.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => Ok(Some((name.trim(), value.trim()))),
            _ => Err(Error::msg(
                ErrorKind::Config,
                format!("auth header must look like `Name: value`, got {header:?}"),
            )),
        }
    }

    /// Build the run configuration, rejecting out-of-range values.
    pub fn to_config(&self) -> Result<UnzipConfig> {
        if !(0.0..1.0).contains(&self.reserve_rate) {
            return Err(Error::msg(
                ErrorKind::Config,
                format!("reserve rate must be in [0, 1), got {}", self.reserve_rate),
            ));
        }
        if self.task_buffer_mb == 0 || self.max_concurrency == 0 || self.retry == 0 {
            return Err(Error::msg(
                ErrorKind::Config,
                "task buffer, max concurrency and retry must be positive",
            ));
        }

        let retry = RetryPolicy::new(self.retry).with_delay(Duration::from_millis(self.retry_delay_ms));
        let mut config = UnzipConfig::new(self.source());
        if let Some(bucket) = &self.target_bucket {
            config.target_bucket = bucket.clone();
        }
        if let Some(region) = &self.target_region {
            config.target_region = region.clone();
        }
        config.target_prefix = self.target_prefix.clone();
        config.extra_root_dir = self.extra_root_dir;
        config.skip_directories = self.skip_directories;
        config.max_file_size = self.max_file_size.saturating_mul(MIB);
        config.reader.local_size_limit = self.local_size_limit.saturating_mul(MIB);
        config.reader.retry = retry;
        if let Some(dir) = &self.cache_dir {
            config.reader.cache_dir = dir.clone();
        }
        config.index.open_retry = retry;
        config.index.entry_attempts = self.retry;
        config.memory_bytes = self.memory_mb.map(|mb| mb.saturating_mul(MIB));
        config.task_buffer_bytes = self.task_buffer_mb.saturating_mul(MIB);
        config.reserve_rate = self.reserve_rate;
        config.max_concurrency = self.max_concurrency;
        config.extra_encodings = self
            .extra_encodings
            .iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        Ok(config)
    }
}
