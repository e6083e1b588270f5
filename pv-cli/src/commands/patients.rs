//! Patient record commands.

use chrono::Local;
use clap::Subcommand;
use console::style;
use dialoguer::Confirm;

use pv_core::config::ConfigHandle;
use pv_core::error::{PvError, PvResult};
use pv_models::Patient;
use pv_services::{PatientRepository, SaveReport};

use crate::OutputFormat;

#[derive(Subcommand)]
pub enum PatientsAction {
    /// List all patients.
    List,
    /// Show one patient.
    Show {
        /// Patient id.
        id: i64,
    },
    /// Search by name or medical record number (case-insensitive).
    Search {
        query: String,
    },
    /// Add a patient.
    Add {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        /// Date of birth (YYYY-MM-DD).
        #[arg(long, value_name = "YYYY-MM-DD")]
        dob: String,
        /// Medical record number; must be unique.
        #[arg(long)]
        mrn: String,
        #[arg(long)]
        notes: Option<String>,
        /// Upload the store to the remote right after saving.
        #[arg(long)]
        push: bool,
    },
    /// Change fields of an existing patient.
    Edit {
        id: i64,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long, value_name = "YYYY-MM-DD")]
        dob: Option<String>,
        #[arg(long)]
        mrn: Option<String>,
        /// New notes; pass an empty string to clear them.
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        push: bool,
    },
    /// Delete a patient.
    Delete {
        id: i64,
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
}

pub async fn run(config: ConfigHandle, action: PatientsAction, format: OutputFormat) -> PvResult<()> {
    let ctx = super::open_context(&config).await?;
    let repo = ctx.repository.clone();

    let result = match action {
        PatientsAction::List => {
            let patients = repo.load_all()?;
            print_patients(&patients, format)
        }
        PatientsAction::Show { id } => {
            let patient = find(&repo, id)?;
            match format {
                OutputFormat::Json => super::print_json(&patient),
                OutputFormat::Text => {
                    print_details(&patient);
                    Ok(())
                }
            }
        }
        PatientsAction::Search { query } => {
            let patients = repo.search(&query)?;
            if patients.is_empty() && format == OutputFormat::Text {
                println!("  No patients match {:?}.", query);
                Ok(())
            } else {
                print_patients(&patients, format)
            }
        }
        PatientsAction::Add { first_name, last_name, dob, mrn, notes, push } => {
            let mut patient = Patient::new(first_name, last_name, super::parse_date(&dob)?, mrn);
            patient.notes = notes.filter(|n| !n.trim().is_empty());
            save(&repo, &mut patient, push, format).await
        }
        PatientsAction::Edit { id, first_name, last_name, dob, mrn, notes, push } => {
            let mut patient = find(&repo, id)?;
            if let Some(v) = first_name {
                patient.first_name = v;
            }
            if let Some(v) = last_name {
                patient.last_name = v;
            }
            if let Some(v) = dob {
                patient.date_of_birth = super::parse_date(&v)?;
            }
            if let Some(v) = mrn {
                patient.medical_record_number = v;
            }
            if let Some(v) = notes {
                patient.notes = Some(v).filter(|n| !n.trim().is_empty());
            }
            save(&repo, &mut patient, push, format).await
        }
        PatientsAction::Delete { id, yes } => {
            let patient = find(&repo, id)?;
            let confirmed = yes
                || Confirm::new()
                    .with_prompt(format!("Delete {} ({})?", patient.full_name(), patient.medical_record_number))
                    .default(false)
                    .interact()
                    .map_err(|e| PvError::Internal(format!("prompt failed: {e}")))?;

            if !confirmed {
                println!("  Cancelled.");
                Ok(())
            } else {
                let removed = repo.delete(&patient)?;
                match format {
                    OutputFormat::Json => super::print_json(&serde_json::json!({
                        "id": id,
                        "deleted": removed,
                    })),
                    OutputFormat::Text => {
                        println!("  {} Deleted {}.", style("OK").green().bold(), patient.full_name());
                        Ok(())
                    }
                }
            }
        }
    };

    ctx.shutdown();
    result
}

fn find(repo: &PatientRepository, id: i64) -> PvResult<Patient> {
    repo.fetch(id)?
        .ok_or_else(|| PvError::ReadFailed(format!("no patient with id {id}")))
}

async fn save(
    repo: &PatientRepository,
    patient: &mut Patient,
    push: bool,
    format: OutputFormat,
) -> PvResult<()> {
    let report = if push {
        repo.save_and_push(patient).await?
    } else {
        let id = repo.save(patient)?;
        SaveReport { id, pushed_to: None, push_error: None }
    };

    match format {
        OutputFormat::Json => super::print_json(&serde_json::json!({
            "patient": patient,
            "pushed_to": report.pushed_to,
            "push_error": report.push_error,
        })),
        OutputFormat::Text => {
            println!(
                "  {} Saved {} (id {}).",
                style("OK").green().bold(),
                patient.full_name(),
                report.id
            );
            if let Some(blob) = &report.pushed_to {
                println!("  {} Uploaded snapshot {}.", style("SYNC").cyan().bold(), blob);
            }
            if let Some(err) = &report.push_error {
                println!("  {} Not uploaded: {}", style("WARN").yellow().bold(), err);
            }
            Ok(())
        }
    }
}

fn print_patients(patients: &[Patient], format: OutputFormat) -> PvResult<()> {
    if format == OutputFormat::Json {
        return super::print_json(patients);
    }

    let today = Local::now().date_naive();
    let mut table = super::new_table();
    table.set_header(vec!["ID", "Name", "Date of birth", "Age", "MRN", "Notes"]);
    for p in patients {
        table.add_row(vec![
            p.id.map(|id| id.to_string()).unwrap_or_default(),
            format!("{}, {}", p.last_name, p.first_name),
            p.date_of_birth.to_string(),
            p.age_on(today).to_string(),
            p.medical_record_number.clone(),
            super::truncate(p.notes.as_deref().unwrap_or(""), 40),
        ]);
    }
    println!("{table}");
    println!("  {} patient(s)", patients.len());
    Ok(())
}

fn print_details(p: &Patient) {
    let today = Local::now().date_naive();
    println!("{}", style(p.full_name()).bold().underlined());
    println!("  ID:             {}", p.id.map(|id| id.to_string()).unwrap_or_default());
    println!("  Date of birth:  {} (age {})", p.date_of_birth, p.age_on(today));
    println!("  MRN:            {}", p.medical_record_number);
    if let Some(notes) = &p.notes {
        println!("  Notes:          {}", notes);
    }
}
