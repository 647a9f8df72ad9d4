//! # Seed Data Generator
//!
//! Populates a local cache store with demo units for development.
//!
//! ## Usage
//! ```bash
//! # Generate 24 units (default)
//! cargo run -p scholar-db --bin seed
//!
//! # Generate custom amount
//! cargo run -p scholar-db --bin seed -- --units 200
//!
//! # Specify database path
//! cargo run -p scholar-db --bin seed -- --db ./data/scholar-cache.db
//! ```
//!
//! ## Generated Content
//! Each unit has:
//! - Id: `{SUBJECT}-{INDEX}`, title from the subject's topic list
//! - 3-6 lessons with a text body
//! - One cover image, plus one audio clip per lesson
//!
//! Content goes through the same apply-delta path a real pull uses, so the
//! seeded store looks exactly like one filled by the sync engine.

use scholar_core::{
    LessonPayload, PulledDelta, PulledLesson, PulledUnit, RemoteAssetMeta, UnitFilter, UnitPayload,
};
use scholar_db::{Database, DbConfig};
use serde_json::json;
use std::env;

/// Subjects and their topics for realistic test data
const SUBJECTS: &[(&str, &[&str])] = &[
    (
        "MATH",
        &[
            "Counting to 100",
            "Addition Facts",
            "Subtraction Facts",
            "Place Value",
            "Fractions",
            "Decimals",
            "Geometry Basics",
            "Measuring Length",
        ],
    ),
    (
        "READ",
        &[
            "Phonics",
            "Sight Words",
            "Story Structure",
            "Main Idea",
            "Making Inferences",
            "Poetry",
        ],
    ),
    (
        "SCI",
        &[
            "Plants and Seeds",
            "The Water Cycle",
            "Magnets",
            "Weather",
            "Animal Habitats",
            "States of Matter",
        ],
    ),
    (
        "HIST",
        &["Timelines", "Maps and Globes", "Community Helpers", "Ancient Egypt"],
    ),
];

const CDN: &str = "https://cdn.scholar.example.com";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut count: usize = 24;
    let mut db_path = String::from("./scholar_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--units" | "-u" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(24);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Scholar Cache Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -u, --units <N>    Number of units to generate (default: 24)");
                println!("  -d, --db <PATH>    Database file path (default: ./scholar_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("🌱 Scholar Cache Seed Data Generator");
    println!("====================================");
    println!("Database: {}", db_path);
    println!("Units:    {}", count);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    let check = db.initialize().await?;

    println!("✓ Connected to database");
    println!("✓ Schema version {}", check.current_version);

    let existing = db.units().count().await?;
    if existing > 0 {
        println!("⚠ Store already has {} units", existing);
        println!("  Skipping seed to avoid duplicates.");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    println!();
    println!("Generating units...");
    let start = std::time::Instant::now();

    let mut delta = PulledDelta {
        cursor: Some("seed-0".to_string()),
        ..Default::default()
    };

    let topics = SUBJECTS
        .iter()
        .flat_map(|(code, titles)| titles.iter().map(move |title| (*code, *title)))
        .cycle()
        .take(count);

    for (index, (subject, topic)) in topics.enumerate() {
        let (unit, lessons) = generate_unit(subject, topic, index);
        delta.units.push(unit);
        delta.lessons.extend(lessons);
    }

    let summary = db.apply_delta(&delta).await?;

    let elapsed = start.elapsed();
    println!();
    println!(
        "✓ Generated {} units, {} lessons, {} assets in {:?}",
        summary.units_upserted, summary.lessons_upserted, summary.assets_updated, elapsed
    );

    let listed = db.units().list(UnitFilter::all()).await?;
    println!("  Listing returns {} units", listed.len());
    println!("  Payload bytes: {}", db.units().payload_bytes().await?);

    println!();
    println!("✓ Seed complete!");

    Ok(())
}

/// Generates one unit and its lessons.
fn generate_unit(subject: &str, topic: &str, seed: usize) -> (PulledUnit, Vec<PulledLesson>) {
    let unit_id = format!("{}-{:03}", subject, seed);
    let lesson_count = 3 + seed % 4;

    let lessons: Vec<PulledLesson> = (0..lesson_count)
        .map(|n| {
            let lesson_id = format!("{}-L{}", unit_id, n + 1);
            let mut payload = LessonPayload::titled(format!("{}: Part {}", topic, n + 1), n as i64);
            payload.body = Some(json!({
                "blocks": [
                    { "type": "text", "text": format!("Welcome to part {} of {}.", n + 1, topic) },
                    { "type": "audio", "asset_id": format!("{}-audio", lesson_id) }
                ]
            }));

            PulledLesson {
                id: lesson_id.clone(),
                unit_id: unit_id.clone(),
                payload,
                assets: vec![RemoteAssetMeta {
                    id: format!("{}-audio", lesson_id),
                    remote_url: format!("{}/audio/{}.mp3", CDN, lesson_id),
                    checksum: None,
                    size: Some(40_000 + (seed as i64 * 97) % 20_000),
                }],
            }
        })
        .collect();

    let mut payload = UnitPayload::titled(topic);
    payload.summary = Some(format!("{} lessons on {}", lesson_count, topic.to_lowercase()));
    payload.lesson_ids = lessons.iter().map(|l| l.id.clone()).collect();
    payload.extra.insert("subject".to_string(), json!(subject));

    let unit = PulledUnit {
        id: unit_id.clone(),
        mode: Default::default(),
        payload,
        assets: vec![RemoteAssetMeta {
            id: format!("{}-cover", unit_id),
            remote_url: format!("{}/covers/{}.png", CDN, unit_id),
            checksum: None,
            size: None,
        }],
    };

    (unit, lessons)
}
