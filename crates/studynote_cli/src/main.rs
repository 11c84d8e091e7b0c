//! CLI smoke entry point.
//!
//! # Responsibility
//! - Verify `studynote_core` linkage with deterministic ping/version output.
//! - With a database path, build a sample outline, flush it, reload it and
//!   print the category tree.

use std::error::Error;
use std::process::ExitCode;
use studynote_core::{
    open_db, Category, EngineConfig, LineKey, OutlineDocument, SqliteOutlineStore,
    SqliteSubjectRepository, StudySession, SubjectRepository,
};

const SAMPLE_OUTLINE: &[&str] = &[
    "# Cell biology",
    "Cells are the basic unit of life.",
    "## Organelles",
    "Mitochondria produce ATP.",
    "### Membranes",
    "Phospholipid bilayer.",
    "## Cell cycle",
    "Interphase, mitosis, cytokinesis.",
    "# Genetics",
    "DNA is a double helix.",
];

fn main() -> ExitCode {
    println!("studynote_core ping={}", studynote_core::ping());
    println!("studynote_core version={}", studynote_core::core_version());

    let Some(db_path) = std::env::args().nth(1) else {
        return ExitCode::SUCCESS;
    };
    match run_sample(&db_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("studynote_cli error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run_sample(db_path: &str) -> Result<(), Box<dyn Error>> {
    let conn = open_db(db_path)?;
    let subject = SqliteSubjectRepository::try_new(&conn)?.create_subject("Biology")?;
    let store = SqliteOutlineStore::try_new(&conn)?;
    let config = EngineConfig::default();

    let mut session = StudySession::open(&store, subject.subject_uuid, &config)?;
    for (position, text) in SAMPLE_OUTLINE.iter().enumerate() {
        session.insert_at(position, *text);
    }
    let report = session.close()?;
    println!(
        "subject={} written={} orphaned={}",
        subject.subject_uuid, report.written, report.orphaned
    );

    let reloaded = OutlineDocument::open(&store, subject.subject_uuid, &config)?;
    let categories = reloaded.categories();
    for root in categories.iter().filter(|category| category.parent.is_none()) {
        print_category(&reloaded, &categories, root, 0);
    }
    Ok(())
}

fn print_category(
    document: &OutlineDocument<&SqliteOutlineStore<'_>>,
    categories: &[Category],
    category: &Category,
    depth: usize,
) {
    let indent = "  ".repeat(depth);
    println!("{indent}{} (level {})", category.title, category.level);
    for key in &category.lines {
        if let Some(line) = document.line(*key) {
            println!("{indent}  - {}", line.display_text());
        }
    }
    for child in &category.children {
        if let Some(child) = find_category(categories, *child) {
            print_category(document, categories, child, depth + 1);
        }
    }
}

fn find_category(categories: &[Category], key: LineKey) -> Option<&Category> {
    categories.iter().find(|category| category.key == key)
}
