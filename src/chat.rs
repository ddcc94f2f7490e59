use std::{
    collections::HashMap,
    io::{BufRead, Write},
};

use anyhow::Result;
use qdrant_client::qdrant::{Filter, Value};
use tracing::{debug, error, info};

use crate::{
    llm::{Assistant, QueryFields},
    settings::Settings,
    vector_db::{match_all, payload_text, VectorStore},
};

const PROMPT: &str = "Please write your question here (or type 'exit' to quit): ";

fn is_exit(line: &str) -> bool {
    let line = line.trim();
    line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit")
}

/// Restricts providers to the insurance and specialty the model extracted.
pub fn provider_filter(fields: &QueryFields) -> Option<Filter> {
    match_all([
        ("insurance_name", fields.insurance.as_str()),
        ("specialization", fields.specialty.as_str()),
    ])
}

pub fn format_provider(provider: &HashMap<String, Value>) -> String {
    let field = |name: &str| payload_text(provider, name);
    format!(
        "
- Doctor: {} {}
- Specialization: {}
- Insurance: {}
- City: {}
- Transportation:
    - Provider: {}
    - Phone: {}
    - Information: {}
",
        field("first_name"),
        field("last_name"),
        field("specialization"),
        field("insurance_name"),
        field("city"),
        field("transportation_name"),
        field("transportation_phone"),
        field("transportation_desc"),
    )
}

/// Answers one question; returns the text shown to the user.
async fn answer(
    assistant: &Assistant,
    store: &VectorStore,
    settings: &Settings,
    question: &str,
) -> Result<String> {
    let (reply, fields) = assistant.split_query(question).await?;
    debug!("Model reply:\n{reply}");
    info!(
        "Extracted assistance: '{}', insurance: '{}', specialty: '{}'",
        fields.assistance, fields.insurance, fields.specialty
    );

    let search_text = if fields.assistance.is_empty() {
        question.to_string()
    } else {
        fields.assistance.clone()
    };
    let vector = assistant
        .embed(vec![search_text])
        .await?
        .pop()
        .unwrap_or_default();
    let providers = store
        .search(
            &settings.qdrant.collection,
            vector,
            provider_filter(&fields),
            settings.chat.result_limit,
        )
        .await?;
    info!("Found {} matching providers", providers.len());

    let providers: Vec<String> = providers.iter().map(format_provider).collect();
    assistant.answer(&fields, &providers).await
}

/// Reads questions from `input` until `exit`, `quit` or end of input.
///
/// A failed question is logged and the loop moves on to the next one.
pub async fn run<R, W>(
    assistant: &Assistant,
    store: &VectorStore,
    settings: &Settings,
    mut input: R,
    mut output: W,
) -> Result<()>
where
    R: BufRead,
    W: Write,
{
    loop {
        write!(output, "{PROMPT}")?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 || is_exit(&line) {
            writeln!(output, "Goodbye!")?;
            return Ok(());
        }
        let question = line.trim();
        if question.is_empty() {
            continue;
        }

        match answer(assistant, store, settings, question).await {
            Ok(reply) => writeln!(output, "\nAssistant's Response:\n{reply}\n")?,
            Err(e) => error!("Failed to answer question: {e:#}"),
        }
    }
}
