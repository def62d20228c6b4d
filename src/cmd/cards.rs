//! Card commands: `foundry add`, `foundry ready`.

use anyhow::{Result, bail};

use foundry::factory::models::CardStatus;

use super::open_project;

pub async fn cmd_add(project_dir: &std::path::Path, title: &str, description: &str, ready: bool) -> Result<()> {
    if title.trim().is_empty() {
        bail!("Card title must not be empty");
    }
    let (_, db, project) = open_project(project_dir).await?;
    let status = if ready { CardStatus::Ready } else { CardStatus::Draft };
    let (title, description) = (title.trim().to_string(), description.to_string());
    let card = db
        .call(move |db| db.create_card(project.id, &title, &description, status))
        .await?;
    println!("Created card #{} '{}' ({})", card.id, card.title, card.status);
    Ok(())
}

pub async fn cmd_ready(project_dir: &std::path::Path, card_id: i64) -> Result<()> {
    let (_, db, project) = open_project(project_dir).await?;
    let card = db.call(move |db| db.get_card(card_id)).await?;
    let Some(card) = card.filter(|c| c.project_id == project.id) else {
        bail!("Card #{} not found", card_id);
    };
    match card.status {
        CardStatus::Ready => {
            println!("Card #{} is already ready", card_id);
            return Ok(());
        }
        CardStatus::InProgress | CardStatus::Testing => {
            bail!("Card #{} is {}; cancel its job first", card_id, card.status);
        }
        _ => {}
    }
    let card = db
        .call(move |db| db.update_card_status(card_id, CardStatus::Ready))
        .await?;
    println!("Card #{} '{}' is ready", card.id, card.title);
    Ok(())
}
