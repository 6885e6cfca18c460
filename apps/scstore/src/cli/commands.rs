//! # CLI Command Implementations

use std::path::{Path, PathBuf};

use scstore_core::primitives::SEGMENTS_FILE_NAME;
use scstore_core::{Addr, Iterator3, ScError, ScType, Storage, StorageConfig};

use crate::config::AppConfig;
use crate::error::AppError;
use crate::import::{GraphDocument, import_graph};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum graph document size for import (500 MB).
const MAX_IMPORT_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), AppError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| AppError::File(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(AppError::File(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Resolve `path` to an existing regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, AppError> {
    let canonical = path
        .canonicalize()
        .map_err(|e| AppError::File(format!("Invalid file path '{}': {}", path.display(), e)))?;

    if !canonical.is_file() {
        return Err(AppError::File(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

fn print_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Create an empty repository and save it.
pub fn cmd_init(config: &AppConfig, force: bool) -> Result<(), AppError> {
    let repo = config.storage.repo_path.as_ref().ok_or_else(|| {
        AppError::Config("init needs a repository: pass --repo or set storage.repo_path".into())
    })?;

    if repo.join(SEGMENTS_FILE_NAME).exists() && !force {
        return Err(AppError::File(format!(
            "Repository {} already exists. Use --force to overwrite.",
            repo.display()
        )));
    }

    let storage = Storage::open(StorageConfig {
        clear: true,
        ..config.storage.clone()
    })?;
    storage.save(&storage.full_context())?;
    storage.shutdown()?;

    println!("Initialized new repository at {}", repo.display());
    Ok(())
}

// =============================================================================
// STATS COMMAND
// =============================================================================

/// Show element counts.
pub fn cmd_stats(config: &AppConfig, json: bool) -> Result<(), AppError> {
    let storage = open_storage(config)?;
    let stat = storage.get_elements_stat(&storage.full_context())?;
    storage.shutdown()?;

    if json {
        print_json(&serde_json::json!(stat));
        return Ok(());
    }

    println!("scstore Elements");
    println!("================");
    println!("Nodes:     {}", stat.nodes);
    println!("Links:     {}", stat.links);
    println!("Arcs:      {}", stat.arcs);
    println!("Empty:     {}", stat.empty);
    println!("Segments:  {}", stat.segments);
    Ok(())
}

// =============================================================================
// IMPORT COMMAND
// =============================================================================

/// Create the elements of a JSON graph document, then save the repository.
pub fn cmd_import(config: &AppConfig, json: bool, file: &Path) -> Result<(), AppError> {
    let path = validate_file_path(file)?;
    validate_file_size(&path, MAX_IMPORT_FILE_SIZE)?;

    let data =
        std::fs::read(&path).map_err(|e| AppError::File(format!("Read file: {}", e)))?;
    let doc: GraphDocument =
        serde_json::from_slice(&data).map_err(|e| AppError::Import(e.to_string()))?;

    tracing::info!("Importing {} elements from {:?}", doc.elements.len(), path);

    let storage = open_storage(config)?;
    let ctx = storage.full_context();
    let report = import_graph(&storage, &ctx, &doc)?;
    if config.storage.repo_path.is_some() {
        storage.save(&ctx)?;
    }
    storage.shutdown()?;

    if json {
        print_json(&serde_json::json!(report));
    } else {
        println!(
            "Imported {} nodes, {} links, {} arcs",
            report.nodes, report.links, report.arcs
        );
    }
    Ok(())
}

// =============================================================================
// FIND COMMAND
// =============================================================================

/// Print the links whose content equals `content`.
pub fn cmd_find(config: &AppConfig, json: bool, content: &str) -> Result<(), AppError> {
    let storage = open_storage(config)?;
    let links = match storage.find_links_with_content(&storage.full_context(), content.as_bytes())
    {
        Ok(links) => links,
        Err(ScError::NotFound) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    storage.shutdown()?;

    if json {
        let addrs: Vec<String> = links.iter().map(Addr::to_string).collect();
        print_json(&serde_json::json!({ "content": content, "links": addrs }));
        return Ok(());
    }

    if links.is_empty() {
        println!("No links with content {:?}", content);
    } else {
        println!("Links with content {:?}:", content);
        for link in &links {
            println!("  {}", link);
        }
    }
    Ok(())
}

// =============================================================================
// ARCS COMMAND
// =============================================================================

/// List the outgoing (or incoming) arcs of the element at `seg:offset`.
pub fn cmd_arcs(
    config: &AppConfig,
    json: bool,
    seg: u16,
    offset: u16,
    incoming: bool,
) -> Result<(), AppError> {
    let addr = Addr::new(seg, offset);
    let storage = open_storage(config)?;
    let rows = list_arcs(&storage, addr, incoming)?;
    storage.shutdown()?;

    if json {
        let rows: Vec<_> = rows
            .iter()
            .map(|(begin, arc, end, ty)| {
                serde_json::json!({
                    "begin": begin.to_string(),
                    "arc": arc.to_string(),
                    "end": end.to_string(),
                    "type": ty.bits(),
                })
            })
            .collect();
        print_json(&serde_json::json!({ "element": addr.to_string(), "arcs": rows }));
        return Ok(());
    }

    let direction = if incoming { "Incoming" } else { "Outgoing" };
    println!("{} arcs of {} ({}):", direction, addr, rows.len());
    for (begin, arc, end, ty) in &rows {
        println!("  {} -[{} {:#06x}]-> {}", begin, arc, ty.bits(), end);
    }
    Ok(())
}

/// `(begin, arc, end, arc type)` rows, newest arc first.
pub fn list_arcs(
    storage: &Storage,
    addr: Addr,
    incoming: bool,
) -> Result<Vec<(Addr, Addr, Addr, ScType)>, AppError> {
    let ctx = storage.full_context();
    let triples: Vec<[Addr; 3]> = if incoming {
        Iterator3::a_a_f(storage, &ctx, ScType::UNKNOWN, ScType::UNKNOWN, addr)?.collect()
    } else {
        Iterator3::f_a_a(storage, &ctx, addr, ScType::UNKNOWN, ScType::UNKNOWN)?.collect()
    };

    triples
        .into_iter()
        .map(|[begin, arc, end]| -> Result<_, AppError> {
            Ok((begin, arc, end, storage.get_element_type(&ctx, arc)?))
        })
        .collect()
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show the effective configuration.
pub fn cmd_status(config: &AppConfig, json: bool) -> Result<(), AppError> {
    let storage = &config.storage;
    let saved = storage
        .repo_path
        .as_ref()
        .is_some_and(|repo| repo.join(SEGMENTS_FILE_NAME).exists());

    if json {
        print_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "storage": storage,
            "repository_saved": saved,
        }));
        return Ok(());
    }

    println!("scstore Status");
    println!("==============");
    println!("Version:          {}", env!("CARGO_PKG_VERSION"));
    match &storage.repo_path {
        Some(repo) => println!("Repository:       {}", repo.display()),
        None => println!("Repository:       (in memory)"),
    }
    println!("Saved data:       {}", if saved { "yes" } else { "no" });
    println!("Max segments:     {}", storage.max_loaded_segments);
    println!("Content backend:  {:?}", storage.content_backend);
    println!("Event workers:    {}", storage.event_worker_count());
    println!("Save on shutdown: {}", storage.save_on_shutdown);
    Ok(())
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Open the store described by `config`.
pub fn open_storage(config: &AppConfig) -> Result<Storage, AppError> {
    Ok(Storage::open(config.storage.clone())?)
}
