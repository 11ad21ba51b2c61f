//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// depot - Local plugin package manager
///
/// Installs plugins from a local artifact source into a versioned cache and
/// switches between cached versions transactionally.
#[derive(Parser, Debug)]
#[command(name = "depot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "DEPOT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Plugin directory (overrides general.plugin_dir)
    #[arg(long, global = true, env = "DEPOT_PLUGIN_DIR")]
    pub plugin_dir: Option<PathBuf>,

    /// Print structured JSON instead of human-readable output
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install a plugin
    Install(InstallArgs),

    /// Update an installed plugin to a newer version
    Update(UpdateArgs),

    /// Switch an installed plugin back to a cached version
    Rollback(RollbackArgs),

    /// Remove an installed plugin
    Uninstall(UninstallArgs),

    /// Check that a plugin's registry entry, cache entry and link agree
    Verify(PluginArgs),

    /// List installed plugins
    List(ListArgs),

    /// List cached versions available for rollback
    Versions(PluginArgs),

    /// Show installed plugins with newer published versions
    Outdated,

    /// Pin a plugin at its active version
    Pin(PluginArgs),

    /// Remove a plugin's pin
    Unpin(PluginArgs),

    /// Inspect and maintain the artifact cache
    Cache(CacheArgs),

    /// Inspect, back up and restore the registry
    Registry(RegistryArgs),

    /// Show configuration
    Config(ConfigArgs),
}

/// A single plugin reference
#[derive(Parser, Debug)]
pub struct PluginArgs {
    /// Plugin id
    pub plugin: String,
}

/// Arguments for the install command
#[derive(Parser, Debug)]
pub struct InstallArgs {
    /// Plugin id, optionally `id@version` (defaults to the latest published)
    pub plugin: String,

    /// Reinstall even if the plugin is already installed
    #[arg(short, long)]
    pub force: bool,

    /// Run lifecycle hooks declared by the plugin
    #[arg(long)]
    pub allow_scripts: bool,

    /// Reject the artifacts unless they hash to this SHA-256
    #[arg(long)]
    pub checksum: Option<String>,

    /// Show what would happen without changing anything
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the update command
#[derive(Parser, Debug)]
pub struct UpdateArgs {
    /// Plugin id, optionally `id@version` (defaults to the latest published)
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    pub plugin: Option<String>,

    /// Update every outdated plugin that is not pinned
    #[arg(long)]
    pub all: bool,

    /// Run lifecycle hooks declared by the plugin
    #[arg(long)]
    pub allow_scripts: bool,

    /// Reject the artifacts unless they hash to this SHA-256
    #[arg(long, conflicts_with = "all")]
    pub checksum: Option<String>,

    /// Show what would happen without changing anything
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the rollback command
#[derive(Parser, Debug)]
pub struct RollbackArgs {
    /// Plugin id
    pub plugin: String,

    /// Cached version to activate
    #[arg(value_name = "VERSION")]
    pub target: String,

    /// Show what would happen without changing anything
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the uninstall command
#[derive(Parser, Debug)]
pub struct UninstallArgs {
    /// Plugin id
    pub plugin: String,

    /// Also remove the plugin's unpinned cached versions
    #[arg(long)]
    pub evict: bool,

    /// Skip the uninstall hook and state checks
    #[arg(short, long)]
    pub force: bool,

    /// Run the plugin's uninstall hook
    #[arg(long)]
    pub allow_scripts: bool,

    /// Show what would happen without changing anything
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only show pinned plugins
    #[arg(long)]
    pub pinned: bool,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show cache usage against the configured limit
    Stats,

    /// Evict least recently used versions until within limits
    Evict {
        /// Size limit in megabytes for this run
        #[arg(long)]
        max_size_mb: Option<u64>,

        /// Versions kept per plugin for this run
        #[arg(long)]
        max_versions: Option<usize>,

        /// Plan only
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove abandoned transaction workspaces
    Cleanup {
        /// Minimum workspace age in hours (default: from config)
        #[arg(long)]
        max_age_hours: Option<i64>,
    },

    /// Rebuild the cache index from the directories on disk
    Rebuild,

    /// Recompute every cached checksum
    Validate {
        /// Evict entries that fail verification
        #[arg(long)]
        repair: bool,
    },
}

/// Arguments for the registry command
#[derive(Parser, Debug)]
pub struct RegistryArgs {
    /// Subcommand for registry
    #[command(subcommand)]
    pub action: RegistryAction,
}

/// Registry subcommands
#[derive(Subcommand, Debug)]
pub enum RegistryAction {
    /// Check the registry for structural problems
    Validate,

    /// Snapshot the registry into the backups directory
    Backup {
        /// Reason recorded in the backup file name
        #[arg(long, default_value = "manual")]
        reason: String,
    },

    /// Replace the registry with a backup
    Restore {
        /// Backup file name or path
        backup: String,
    },

    /// List registry backups, newest first
    Backups,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Split `id@version` into its parts
pub fn parse_plugin_ref(raw: &str) -> (String, Option<String>) {
    match raw.split_once('@') {
        Some((id, version)) if !version.is_empty() => (id.to_string(), Some(version.to_string())),
        Some((id, _)) => (id.to_string(), None),
        None => (raw.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_ref_with_version() {
        assert_eq!(
            parse_plugin_ref("alpha@1.2.0"),
            ("alpha".to_string(), Some("1.2.0".to_string()))
        );
        assert_eq!(parse_plugin_ref("alpha"), ("alpha".to_string(), None));
        assert_eq!(parse_plugin_ref("alpha@"), ("alpha".to_string(), None));
    }

    #[test]
    fn cli_parses_install() {
        let cli = Cli::parse_from(["depot", "install", "alpha", "--allow-scripts", "--force"]);
        match cli.command {
            Commands::Install(args) => {
                assert_eq!(args.plugin, "alpha");
                assert!(args.allow_scripts);
                assert!(args.force);
                assert!(!args.dry_run);
            }
            _ => panic!("expected Install command"),
        }
    }

    #[test]
    fn cli_parses_update_all() {
        let cli = Cli::parse_from(["depot", "update", "--all"]);
        match cli.command {
            Commands::Update(args) => {
                assert!(args.all);
                assert!(args.plugin.is_none());
            }
            _ => panic!("expected Update command"),
        }
    }

    #[test]
    fn cli_update_requires_plugin_or_all() {
        assert!(Cli::try_parse_from(["depot", "update"]).is_err());
        assert!(Cli::try_parse_from(["depot", "update", "alpha", "--all"]).is_err());
    }

    #[test]
    fn cli_parses_rollback() {
        let cli = Cli::parse_from(["depot", "rollback", "alpha", "1.0.0", "--dry-run"]);
        match cli.command {
            Commands::Rollback(args) => {
                assert_eq!(args.target, "1.0.0");
                assert!(args.dry_run);
            }
            _ => panic!("expected Rollback command"),
        }
    }

    #[test]
    fn cli_parses_cache_validate_repair() {
        let cli = Cli::parse_from(["depot", "cache", "validate", "--repair"]);
        match cli.command {
            Commands::Cache(CacheArgs {
                action: CacheAction::Validate { repair },
            }) => assert!(repair),
            _ => panic!("expected cache validate"),
        }
    }

    #[test]
    fn cli_global_flags() {
        let cli = Cli::parse_from(["depot", "list", "--json", "--plugin-dir", "/tmp/p"]);
        assert!(cli.json);
        assert_eq!(cli.plugin_dir, Some(PathBuf::from("/tmp/p")));
    }

    #[test]
    fn cli_verbose_levels() {
        let cli = Cli::parse_from(["depot", "outdated"]);
        assert_eq!(cli.verbose, 0);

        let cli = Cli::parse_from(["depot", "-v", "outdated"]);
        assert_eq!(cli.verbose, 1);

        let cli = Cli::parse_from(["depot", "-vv", "outdated"]);
        assert_eq!(cli.verbose, 2);
    }
}
