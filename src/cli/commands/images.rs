//! Images command - list images in the store

use crate::cli::args::{ImagesArgs, OutputFormat};
use crate::error::StrataResult;
use crate::image::{ImageId, ImageRecord};
use crate::store::LocalStore;
use console::style;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// One line of the listing
#[derive(Debug, Serialize)]
struct ImageRow {
    tags: Vec<String>,
    id: ImageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<ImageId>,
    platform: String,
    created: String,
    layers: usize,
}

/// Execute the images command
pub async fn execute(args: ImagesArgs, store_root: &Path) -> StrataResult<()> {
    let store = LocalStore::open(store_root)?;
    let images = store.list_images().await?;

    let mut tags: BTreeMap<ImageId, Vec<String>> = BTreeMap::new();
    for tag in store.tags()? {
        tags.entry(tag.image).or_default().push(tag.name);
    }

    let rows = rows(images, &tags, args.all);
    match args.format {
        OutputFormat::Table => print_table(&rows),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Plain => {
            for row in &rows {
                println!("{}", row.id);
            }
        }
    }
    Ok(())
}

/// Tagged images, or every image with `all`
fn rows(images: Vec<ImageRecord>, tags: &BTreeMap<ImageId, Vec<String>>, all: bool) -> Vec<ImageRow> {
    images
        .into_iter()
        .filter(|image| all || tags.contains_key(&image.id))
        .map(|image| ImageRow {
            tags: tags.get(&image.id).cloned().unwrap_or_default(),
            platform: image.platform().to_string(),
            created: image.config.created.format("%Y-%m-%d %H:%M").to_string(),
            layers: image.diff_ids().len(),
            parent: image.parent,
            id: image.id,
        })
        .collect()
}

fn print_table(rows: &[ImageRow]) {
    if rows.is_empty() {
        println!("{}", style("No images").dim());
        return;
    }

    println!(
        "{:<20} {:<14} {:<14} {:<18} {:>6}",
        style("TAG").bold(),
        style("IMAGE ID").bold(),
        style("PLATFORM").bold(),
        style("CREATED").bold(),
        style("LAYERS").bold()
    );
    println!("{}", "-".repeat(76));

    for row in rows {
        let tag = if row.tags.is_empty() {
            "<none>".to_string()
        } else {
            row.tags.join(",")
        };
        println!(
            "{:<20} {:<14} {:<14} {:<18} {:>6}",
            tag,
            row.id.short(),
            row.platform,
            row.created,
            row.layers
        );
    }

    println!();
    println!("{} image(s)", rows.len());
}
