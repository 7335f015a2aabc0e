use anyhow::{bail, Context, Result};
use chrono::{Datelike, Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use rollcall_core::classifier::ClassifierStore;
use rollcall_core::onnx::{OnnxEmbedder, OnnxFaceLocator};
use rollcall_core::{Config, DecisionGate, RecognitionEngine};
use rollcall_hw::{FrameSource, ImageFolderSource};
use rollcall_store::enrollment::{retrain, EnrollReport, Enroller, TrainReport};
use rollcall_store::{NewStudent, Sheet, Store, StudentOrder, StudentUpdate};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod images;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn start_stream(&self) -> zbus::Result<String>;
    async fn stop_stream(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Classroom attendance with face recognition", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage students
    #[command(subcommand)]
    Student(StudentCommand),
    /// Re-embed a student's image folder and retrain
    Enroll {
        /// Student id
        id: i64,
    },
    /// Rebuild the classifier from all stored embeddings
    Train,
    /// Recognize faces in an image file or a folder of images
    Recognize {
        path: PathBuf,
        /// Write annotated frames into this directory
        #[arg(long)]
        save: Option<PathBuf>,
        /// Mark recognized students present
        #[arg(long)]
        mark: bool,
    },
    /// Create Absent rows for students not yet recorded
    InitDay {
        /// Date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Show attendance
    #[command(subcommand)]
    Attendance(AttendanceCommand),
    /// Export attendance sheets as CSV
    #[command(subcommand)]
    Export(ExportCommand),
    /// Monthly weekday percentages plus per-student sheets
    Report {
        #[command(flatten)]
        month: MonthArgs,
        /// Directory for the per-student CSV sheets
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Control the daemon's camera stream
    #[command(subcommand)]
    Stream(StreamCommand),
}

#[derive(Subcommand)]
enum StudentCommand {
    /// Register a student, import their images and enroll them
    Add {
        full_name: String,
        #[arg(long)]
        roll: String,
        #[arg(long)]
        mobile: Option<String>,
        #[arg(long)]
        email: Option<String>,
        /// Enrollment images to copy into the student's folder
        #[arg(long, num_args = 1..)]
        images: Vec<PathBuf>,
    },
    /// List students
    List {
        /// Order by roll number instead of name
        #[arg(long)]
        by_roll: bool,
    },
    /// Update a student; new images replace the old ones and re-enroll
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        roll: Option<String>,
        #[arg(long)]
        mobile: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long, num_args = 1..)]
        images: Vec<PathBuf>,
    },
    /// Delete a student with their attendance and embeddings
    Remove { id: i64 },
}

#[derive(Subcommand)]
enum AttendanceCommand {
    /// Every student's status today
    Today,
    /// Recorded rows for one date
    Day { date: NaiveDate },
    /// Present/Absent counts per day of a month
    Month {
        #[command(flatten)]
        month: MonthArgs,
    },
    /// One student's month
    Student {
        id: i64,
        #[command(flatten)]
        month: MonthArgs,
    },
}

#[derive(Subcommand)]
enum ExportCommand {
    /// Today's snapshot: every student, Absent by default
    Today {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Recorded rows for one date
    Day {
        date: NaiveDate,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// One student's month
    Student {
        id: i64,
        #[command(flatten)]
        month: MonthArgs,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum StreamCommand {
    /// Start recognizing from the camera
    Start,
    /// Stop the running stream
    Stop,
    /// Show the daemon's stream and ledger status
    Status,
}

#[derive(Args, Clone, Copy)]
struct MonthArgs {
    /// Year; defaults to the current year
    #[arg(long)]
    year: Option<i32>,
    /// Month (1-12); defaults to the current month
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=12))]
    month: Option<u32>,
}

impl MonthArgs {
    fn resolve(self, today: NaiveDate) -> (i32, u32) {
        (
            self.year.unwrap_or_else(|| today.year()),
            self.month.unwrap_or_else(|| today.month()),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let config = Config::load().context("failed to load configuration")?;
    let today = Local::now().date_naive();

    match cli.command {
        Commands::Student(cmd) => cmd_student(&config, cmd),
        Commands::Enroll { id } => cmd_enroll(&config, id),
        Commands::Train => cmd_train(&config),
        Commands::Recognize { path, save, mark } => cmd_recognize(&config, &path, save, mark),
        Commands::InitDay { date } => cmd_init_day(&config, date.unwrap_or(today)),
        Commands::Attendance(cmd) => cmd_attendance(&config, cmd, today),
        Commands::Export(cmd) => cmd_export(&config, cmd, today),
        Commands::Report { month, out_dir } => cmd_report(&config, month, out_dir, today),
        Commands::Stream(cmd) => cmd_stream(cmd).await,
    }
}

fn open_store(config: &Config) -> Result<Store> {
    let path = config.db_path();
    Store::open(&path).with_context(|| format!("failed to open {}", path.display()))
}

fn load_models(config: &Config) -> Result<(OnnxFaceLocator, OnnxEmbedder)> {
    let locator = OnnxFaceLocator::load(&config.detector_model_path(), config.detection_threshold)?;
    let extractor = OnnxEmbedder::load(&config.embedder_model_path())?;
    Ok((locator, extractor))
}

/// Re-embed the student's folder and rebuild the classifier.
fn enroll_and_train(config: &Config, store: &Store, id: i64) -> Result<()> {
    let student = store.get_student(id)?;
    let (mut locator, mut extractor) = load_models(config)?;
    let embedding_dir = config.embedding_dir();
    let report = Enroller::new(store, &mut locator, &mut extractor, &embedding_dir)
        .reenroll(&student)?;
    print_enroll_report(&student.full_name, &report);
    if report.saved.is_empty() {
        println!("! No usable face found for {}", student.full_name);
    }
    train(config, store)
}

fn train(config: &Config, store: &Store) -> Result<()> {
    let report = retrain(store, &config.classifier_dir(), config.knn_k)?;
    print_train_report(&report);
    Ok(())
}

fn print_enroll_report(name: &str, report: &EnrollReport) {
    println!(
        "Enrolled {name}: {} embedding(s) saved, {} image(s) skipped",
        report.saved.len(),
        report.skipped.len()
    );
    for skipped in &report.skipped {
        println!("  skipped {}: {}", skipped.path.display(), skipped.reason);
    }
}

fn print_train_report(report: &TrainReport) {
    println!(
        "✓ Classifier trained on {} embedding(s) for {} student(s)",
        report.samples,
        report.labels.len()
    );
    if report.skipped_artifacts > 0 {
        println!("  {} unreadable embedding file(s) skipped", report.skipped_artifacts);
    }
}

fn cmd_student(config: &Config, cmd: StudentCommand) -> Result<()> {
    let store = open_store(config)?;
    match cmd {
        StudentCommand::Add {
            full_name,
            roll,
            mobile,
            email,
            images,
        } => {
            let folder = images::student_folder(&config.image_dir(), &full_name);
            let student = store.add_student(&NewStudent {
                full_name,
                roll_no: roll,
                mobile,
                email,
                image_folder: folder.clone(),
            })?;
            println!(
                "✓ Added {} (id {}, roll {})",
                student.full_name, student.id, student.roll_no
            );

            let copied = images::import_images(&images, &folder, false)?;
            if copied.is_empty() {
                println!(
                    "No images imported; run `rollcall enroll {}` once images are in {}",
                    student.id,
                    folder.display()
                );
                return Ok(());
            }
            enroll_and_train(config, &store, student.id)
        }
        StudentCommand::List { by_roll } => {
            let order = if by_roll {
                StudentOrder::RollNo
            } else {
                StudentOrder::Name
            };
            let students = store.list_students(order)?;
            if students.is_empty() {
                println!("No students registered");
                return Ok(());
            }
            println!("{:<6} {:<28} {:<12} {:<16} {}", "ID", "Name", "Roll No", "Mobile", "Email");
            println!("{}", "-".repeat(80));
            for s in students {
                println!(
                    "{:<6} {:<28} {:<12} {:<16} {}",
                    s.id,
                    s.full_name,
                    s.roll_no,
                    s.mobile.as_deref().unwrap_or("-"),
                    s.email.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
        StudentCommand::Update {
            id,
            name,
            roll,
            mobile,
            email,
            images,
        } => {
            let renamed = name.is_some();
            // A rename moves the folder only when fresh images come with it.
            let image_folder = match (&name, images.is_empty()) {
                (Some(n), false) => Some(images::student_folder(&config.image_dir(), n)),
                _ => None,
            };

            let student = store.update_student(
                id,
                &StudentUpdate {
                    full_name: name,
                    roll_no: roll,
                    mobile,
                    email,
                    image_folder,
                },
            )?;
            println!("✓ Updated {} (id {})", student.full_name, student.id);

            if !images.is_empty() {
                images::import_images(&images, &student.image_folder, true)?;
                enroll_and_train(config, &store, id)
            } else if renamed {
                // Labels come from the current name.
                train(config, &store)
            } else {
                Ok(())
            }
        }
        StudentCommand::Remove { id } => {
            let student = store.delete_student(id)?;
            println!("✓ Removed {} (roll {})", student.full_name, student.roll_no);
            match retrain(&store, &config.classifier_dir(), config.knn_k) {
                Ok(report) => print_train_report(&report),
                Err(e) => println!("! Classifier not rebuilt: {e}"),
            }
            Ok(())
        }
    }
}

fn cmd_enroll(config: &Config, id: i64) -> Result<()> {
    let store = open_store(config)?;
    enroll_and_train(config, &store, id)
}

fn cmd_train(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    train(config, &store)
}

fn cmd_recognize(config: &Config, path: &Path, save: Option<PathBuf>, mark: bool) -> Result<()> {
    let classifier = ClassifierStore::load(&config.classifier_dir())?;
    let (locator, extractor) = load_models(config)?;
    let mut engine =
        RecognitionEngine::new(locator, extractor, classifier, DecisionGate::from_config(config));

    let mut source = if path.is_dir() {
        ImageFolderSource::open(path)?
    } else {
        ImageFolderSource::from_paths(vec![path.to_path_buf()])
    };
    let store = if mark { Some(open_store(config)?) } else { None };
    if let Some(dir) = &save {
        std::fs::create_dir_all(dir)?;
    }

    let mut index = 0;
    while let Some(frame) = source.next_frame()? {
        index += 1;
        let (annotated, name) = engine.recognize(frame);
        println!("[{index}] {}", annotated.caption());

        if let (Some(store), Some(name)) = (&store, &name) {
            let outcome = store.mark_present(name, Local::now().naive_local())?;
            println!("    ledger: {outcome:?}");
        }
        if let Some(dir) = &save {
            let out = dir.join(format!("frame_{index:04}.png"));
            annotated
                .image
                .save(&out)
                .with_context(|| format!("failed to save {}", out.display()))?;
        }
    }
    if index == 0 {
        bail!("no images found at {}", path.display());
    }
    Ok(())
}

fn cmd_init_day(config: &Config, date: NaiveDate) -> Result<()> {
    let store = open_store(config)?;
    let now = Local::now().naive_local();
    let created = store.initialize_day(date, now)?;
    println!("✓ {date}: {created} Absent row(s) created");
    Ok(())
}

fn cmd_attendance(config: &Config, cmd: AttendanceCommand, today: NaiveDate) -> Result<()> {
    let store = open_store(config)?;
    match cmd {
        AttendanceCommand::Today => {
            let roster = store.daily_roster(today)?;
            println!("Attendance for {today} ({})", today.format("%A"));
            println!("{:<12} {:<28} {}", "Roll No", "Name", "Status");
            println!("{}", "-".repeat(50));
            for entry in &roster {
                println!(
                    "{:<12} {:<28} {}",
                    entry.student.roll_no, entry.student.full_name, entry.status
                );
            }
            println!("\nPresent: {} / {}", store.present_count(today)?, roster.len());
        }
        AttendanceCommand::Day { date } => {
            let records = store.day_records(date)?;
            if records.is_empty() {
                println!("No attendance recorded on {date}");
            }
            for r in records {
                println!("{:<12} {:<28} {}", r.roll_no, r.full_name, r.status);
            }
        }
        AttendanceCommand::Month { month } => {
            let (year, month) = month.resolve(today);
            println!("{:<12} {:>8} {:>8}", "Date", "Present", "Absent");
            for day in store.monthly_summary(year, month)? {
                println!("{:<12} {:>8} {:>8}", day.date, day.present, day.absent);
            }
        }
        AttendanceCommand::Student { id, month } => {
            let (year, month) = month.resolve(today);
            let view = store.student_month(id, year, month)?;
            println!(
                "{} ({}), {year}-{month:02}",
                view.student.full_name, view.student.roll_no
            );
            for r in &view.records {
                println!("{:<12} {:<10} {}", r.date, r.day_of_week, r.status);
            }
            let s = view.summary;
            println!(
                "\nTotal {}  Present {}  Absent {}  ({:.2}%)",
                s.total, s.present, s.absent, s.percentage
            );
        }
    }
    Ok(())
}

fn write_sheet(sheet: &Sheet, output: Option<PathBuf>, default_name: String) -> Result<()> {
    let path = output.unwrap_or_else(|| PathBuf::from(default_name));
    sheet
        .write_csv(&path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("✓ {} row(s) written to {}", sheet.rows.len(), path.display());
    Ok(())
}

fn cmd_export(config: &Config, cmd: ExportCommand, today: NaiveDate) -> Result<()> {
    let store = open_store(config)?;
    match cmd {
        ExportCommand::Today { output } => write_sheet(
            &store.snapshot_sheet(today)?,
            output,
            format!("attendance_{today}.csv"),
        ),
        ExportCommand::Day { date, output } => write_sheet(
            &store.day_sheet(date)?,
            output,
            format!("attendance_{date}.csv"),
        ),
        ExportCommand::Student { id, month, output } => {
            let (year, month) = month.resolve(today);
            write_sheet(
                &store.student_month_sheet(id, year, month)?,
                output,
                format!("student_{id}_{year}-{month:02}.csv"),
            )
        }
    }
}

fn cmd_report(
    config: &Config,
    month: MonthArgs,
    out_dir: Option<PathBuf>,
    today: NaiveDate,
) -> Result<()> {
    let store = open_store(config)?;
    let (year, month) = month.resolve(today);
    let reports = store.monthly_reports(year, month, today)?;
    let (_, last) = rollcall_store::ledger::month_bounds(year, month)?;
    println!(
        "Monthly attendance {year}-{month:02} (weekdays through {})",
        today.min(last)
    );
    for report in &reports {
        println!(
            "{:<12} {:<28} {:>7.2}%",
            report.student.roll_no, report.student.full_name, report.percentage
        );
        if let Some(dir) = &out_dir {
            let path = dir.join(format!(
                "{}_{year}-{month:02}.csv",
                rollcall_core::names::label_for(&report.student.full_name)
            ));
            report.sheet.write_csv(&path)?;
        }
    }
    if let Some(dir) = &out_dir {
        println!("\n✓ {} sheet(s) written to {}", reports.len(), dir.display());
    }
    Ok(())
}

async fn cmd_stream(cmd: StreamCommand) -> Result<()> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cmd {
        StreamCommand::Start => {
            let id = proxy.start_stream().await?;
            println!("✓ Stream started (session {id})");
        }
        StreamCommand::Stop => {
            if proxy.stop_stream().await? {
                println!("✓ Stream stopped");
            } else {
                println!("No stream was running");
            }
        }
        StreamCommand::Status => {
            let raw = proxy.status().await?;
            let status: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}
