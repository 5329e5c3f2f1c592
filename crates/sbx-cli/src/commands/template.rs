use std::path::Path;
use std::time::Duration;

use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use crate::cli::TemplateCommand;
use crate::error::{CliError, exit};
use crate::template::{Template, TemplateStore};

#[derive(Tabled)]
struct TemplateRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "TIMEOUT")]
    timeout: String,
    #[tabled(rename = "CREATED")]
    created: String,
    #[tabled(rename = "DESCRIPTION")]
    description: String,
}

impl From<&Template> for TemplateRow {
    fn from(t: &Template) -> Self {
        Self {
            name: t.name.clone(),
            timeout: format!("{}s", t.timeout_secs),
            created: t.created_at.format("%Y-%m-%d %H:%M").to_string(),
            description: if t.description.is_empty() {
                "-".into()
            } else {
                t.description.clone()
            },
        }
    }
}

pub fn run(config_dir: &Path, action: TemplateCommand) -> Result<i32, CliError> {
    let store = TemplateStore::in_config_dir(config_dir);
    match action {
        TemplateCommand::Add {
            name,
            script,
            description,
            timeout,
        } => {
            let template = store.add(&name, &script, &description, Duration::from_secs(timeout))?;
            println!("added template {} ({}s timeout)", template.name, template.timeout_secs);
        }
        TemplateCommand::List => {
            let templates = store.list()?;
            if templates.is_empty() {
                println!("No templates");
            } else {
                println!("{}", render(&templates));
            }
        }
        TemplateCommand::Show { name } => {
            let template = store.get(&name)?;
            let script = store.script(&name)?;
            println!("name:        {}", template.name);
            println!("description: {}", template.description);
            println!("timeout:     {}s", template.timeout_secs);
            println!("created:     {}", template.created_at.to_rfc3339());
            if store.is_modified(&template)? {
                eprintln!("warning: init.sh changed since the template was added");
            }
            println!("---");
            print!("{}", String::from_utf8_lossy(&script));
        }
        TemplateCommand::Remove { name } => {
            store.remove(&name)?;
            println!("removed template {name}");
        }
    }
    Ok(exit::SUCCESS)
}

fn render(templates: &[Template]) -> String {
    let rows: Vec<TemplateRow> = templates.iter().map(TemplateRow::from).collect();
    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..4), Padding::new(0, 1, 0, 0));
    table.to_string()
}
