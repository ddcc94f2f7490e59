use anyhow::{anyhow, bail, Context, Result};
use ollama_rs::{
    generation::{
        chat::{request::ChatMessageRequest, ChatMessage},
        embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest},
    },
    models::ModelOptions,
    Ollama,
};
use reqwest::Url;
use tracing::debug;

use crate::settings::OllamaSettings;

const SPLIT_SYSTEM: &str = "You are a helpful assistant that processes healthcare queries.";

const SPLIT_TEMPLATE: &str = r#"
You will be provided with a query related to healthcare assistance and insurance.
Your task is to summarize and split the query into three sections:

**Ensure that your response strictly follows this format:**

Here are the results:

* **assistance:** The part of the query describing the medical assistance needed.
* **insurance:** The name of the insurance provider mentioned in the query.
* **specialty:** The medical specialty that is most relevant to the assistance needed.

ONLY provide the 'assistance', 'insurance', and 'specialty' without any parentheses or commas.
If the 'insurance' is molina or molina healthcare, your format will be molina_healthcare.
If the 'insurance' is blue cross or blue shield or blue cross blue shield, your format will be blue_cross_blue_shield.
If the 'insurance' is anthem or blue anthem or anthem blue cross blue shield, your format will be anthem_blue_cross_blue_shield.
If no insurance provider is mentioned, leave the 'insurance' section empty.

**In determining the 'specialty', prioritize the following:**

1. **Explicit mentions of medical professionals or specialties:** If the query directly states the type of doctor or medical field needed (e.g., "cardiologist", "dermatology"), use that as the 'specialty'.
2. **Procedures or treatments:** If the query mentions specific procedures or treatments, infer the most likely specialty associated with them (e.g., "root canal" -> "dentist", "mammogram" -> "radiologist").
3. **Symptoms or conditions:** If the query describes symptoms or conditions, deduce the most relevant specialty that typically handles such cases (e.g., "chest pain" -> "cardiologist", "rash" -> "dermatologist").

**Query:** {query}

**assistance:**
**insurance:**
**specialty:**
"#;

const ANSWER_SYSTEM: &str = r"
You are a chatbot assistant that ONLY provides the doctors who accept the provided insurance.
Provide ONLY the doctors that are specialized in the provided specialty. If not sure, you can check search tags for more info.

Respond ONLY with the following data in this EXACT format, DO NOT truncate the data, and provide the data every time:

- Doctor: {first_name} {last_name}
- Specialization: {specialization}
- Insurance: {insurance_name}
- City: {city}
- Transportation:
    - Provider: {transportation_name}
    - Phone: {transportation_phone}
    - Information: {transportation_desc}

DO NOT provide any additional information or context.
DO NOT act as the doctor.
DO NOT provide medical advice.
Please provide three responses.
";

const NO_MATCH: &str = "I'm sorry, but I couldn't find any doctors matching your criteria.";

/// The three parts the model splits a query into. Absent parts are empty.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueryFields {
    pub assistance: String,
    pub insurance: String,
    pub specialty: String,
}

pub fn split_prompt(query: &str) -> String {
    SPLIT_TEMPLATE.replace("{query}", query)
}

/// Extracts `key: value` lines from a reply, ignoring markdown emphasis.
///
/// Keys are matched case-insensitively and later lines win.
pub fn parse_reply(reply: &str) -> QueryFields {
    let mut fields = QueryFields::default();
    for line in reply.trim().lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.replace('*', "").trim().to_lowercase();
        let value = value.replace('*', "").trim().to_string();
        match key.as_str() {
            "assistance" => fields.assistance = value,
            "insurance" => fields.insurance = value,
            "specialty" => fields.specialty = value,
            _ => {}
        }
    }
    fields
}

/// Builds the request for the final answer from the rendered provider blocks.
pub fn final_prompt(fields: &QueryFields, providers: &[String]) -> String {
    let providers = if providers.is_empty() {
        NO_MATCH.to_string()
    } else {
        providers.join("\n")
    };
    format!(
        "\nBased on your request for assistance: \"{assistance}\", insurance: \"{insurance}\", and specialty: \"{specialty}\", here are some doctors that might be able to help:\n\n{providers}\n\nPlease let me know if you need further assistance or information.\n",
        assistance = fields.assistance,
        insurance = fields.insurance,
        specialty = fields.specialty,
    )
}

fn server_url(host: &str, port: u16) -> Result<Url> {
    let mut url =
        Url::parse(host).with_context(|| format!("Invalid Ollama host '{host}'"))?;
    if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
        bail!("Invalid Ollama host '{host}': expected http(s)://<host>");
    }
    url.set_port(Some(port))
        .map_err(|()| anyhow!("Invalid Ollama host '{host}': cannot set port"))?;
    Ok(url)
}

/// Chat and embedding client for a single Ollama server.
pub struct Assistant {
    client: Ollama,
    chat_model: String,
    embed_model: String,
}

impl Assistant {
    /// Fails when `host` is not an absolute `http`/`https` URL.
    pub fn new(settings: &OllamaSettings) -> Result<Self> {
        Ok(Self {
            client: Ollama::from_url(server_url(&settings.host, settings.port)?),
            chat_model: settings.chat_model.clone(),
            embed_model: settings.embed_model.clone(),
        })
    }

    /// Asks the model to split `query` into its parts.
    ///
    /// Returns the raw reply along with the parsed fields.
    pub async fn split_query(&self, query: &str) -> Result<(String, QueryFields)> {
        let reply = self.chat(SPLIT_SYSTEM, &split_prompt(query), 0.0).await?;
        let fields = parse_reply(&reply);
        Ok((reply, fields))
    }

    pub async fn answer(&self, fields: &QueryFields, providers: &[String]) -> Result<String> {
        self.chat(ANSWER_SYSTEM, &final_prompt(fields, providers), 0.7)
            .await
    }

    pub async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let count = texts.len();
        let request =
            GenerateEmbeddingsRequest::new(self.embed_model.clone(), EmbeddingsInput::Multiple(texts));
        let response = self
            .client
            .generate_embeddings(request)
            .await
            .context("Failed to generate embeddings")?;
        anyhow::ensure!(
            response.embeddings.len() == count,
            "Expected {count} embeddings, got {}",
            response.embeddings.len()
        );
        Ok(response.embeddings)
    }

    async fn chat(&self, system: &str, user: &str, temperature: f32) -> Result<String> {
        debug!("Sending chat request to model '{}'", self.chat_model);
        let request = ChatMessageRequest::new(
            self.chat_model.clone(),
            vec![
                ChatMessage::system(system.to_string()),
                ChatMessage::user(user.to_string()),
            ],
        )
        .options(ModelOptions::default().temperature(temperature));
        let response = self
            .client
            .send_chat_messages(request)
            .await
            .context("Chat request failed")?;
        Ok(response.message.content)
    }
}
