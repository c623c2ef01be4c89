use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::sync::Arc;
use log::info;

pub const CONDENSE_QUESTION: &str = "condense_question";
pub const CONTEXT_ANSWER: &str = "context_answer";

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an expert on the Streamlit Python library and your job is to answer technical questions. \
Assume that all questions are related to the Streamlit Python library. \
Keep your answers technical and based on facts - do not hallucinate features.";

const DEFAULT_GREETING: &str = "Ask me a question about Streamlit's open-source Python library!";

const DEFAULT_CONDENSE_TEMPLATE: &str =
    "Given a conversation (between User and Assistant) and a follow up message from User, \
rewrite the message to be a standalone question that captures all relevant context from the conversation.\n\n\
<Chat History>\n{chat_history}\n\
<Follow Up Message>\n{question}\n\n\
<Standalone question>\n";

const DEFAULT_ANSWER_TEMPLATE: &str =
    "Context information is below.\n\
---------------------\n\
{context}\n\
---------------------\n\
Given the context information and not prior knowledge, answer the query.\n\
Query: {question}\n\
Answer: ";

#[derive(Debug)]
pub enum PromptError {
    TemplateNotFound(String),
    MissingPlaceholder {
        template: String,
        placeholder: &'static str,
    },
    IoError(std::io::Error),
    JsonError(serde_json::Error),
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::TemplateNotFound(key) => write!(f, "Prompt template '{}' not found", key),
            PromptError::MissingPlaceholder { template, placeholder } =>
                write!(f, "Prompt template '{}' is missing the {} placeholder", template, placeholder),
            PromptError::IoError(e) => write!(f, "Prompt file IO error: {}", e),
            PromptError::JsonError(e) => write!(f, "Prompt JSON parsing error: {}", e),
        }
    }
}

impl Error for PromptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PromptError::IoError(e) => Some(e),
            PromptError::JsonError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PromptError {
    fn from(err: std::io::Error) -> Self {
        PromptError::IoError(err)
    }
}

impl From<serde_json::Error> for PromptError {
    fn from(err: serde_json::Error) -> Self {
        PromptError::JsonError(err)
    }
}

/// Prompt text used by the chat engine. Any field left out of the JSON file
/// keeps its built-in value.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PromptConfig {
    pub system_prompt: String,
    pub greeting: String,
    pub query_templates: HashMap<String, String>,
    pub response_templates: HashMap<String, String>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            greeting: DEFAULT_GREETING.to_string(),
            query_templates: HashMap::from([
                (CONDENSE_QUESTION.to_string(), DEFAULT_CONDENSE_TEMPLATE.to_string()),
            ]),
            response_templates: HashMap::from([
                (CONTEXT_ANSWER.to_string(), DEFAULT_ANSWER_TEMPLATE.to_string()),
            ]),
        }
    }
}

impl PromptConfig {
    fn fill_missing_templates(&mut self) {
        let defaults = PromptConfig::default();
        for (key, template) in defaults.query_templates {
            self.query_templates.entry(key).or_insert(template);
        }
        for (key, template) in defaults.response_templates {
            self.response_templates.entry(key).or_insert(template);
        }
    }

    fn validate(&self) -> Result<(), PromptError> {
        let condense = get_query_template(self, CONDENSE_QUESTION)?;
        for placeholder in ["{chat_history}", "{question}"] {
            if !condense.contains(placeholder) {
                return Err(PromptError::MissingPlaceholder {
                    template: CONDENSE_QUESTION.to_string(),
                    placeholder,
                });
            }
        }
        let answer = get_response_template(self, CONTEXT_ANSWER)?;
        for placeholder in ["{context}", "{question}"] {
            if !answer.contains(placeholder) {
                return Err(PromptError::MissingPlaceholder {
                    template: CONTEXT_ANSWER.to_string(),
                    placeholder,
                });
            }
        }
        Ok(())
    }
}

pub fn load_prompts_from_str(content: &str) -> Result<PromptConfig, PromptError> {
    let mut config: PromptConfig = serde_json::from_str(content)?;
    config.fill_missing_templates();
    config.validate()?;
    Ok(config)
}

/// Built-in prompts when `path` is `None`.
pub fn load_prompts(path: Option<&str>) -> Result<Arc<PromptConfig>, Box<dyn Error + Send + Sync>> {
    let Some(path) = path else {
        return Ok(Arc::new(PromptConfig::default()));
    };
    let file_content = fs
        ::read_to_string(path)
        .map_err(|e| format!("Failed to read prompts file '{}': {}", path, e))?;
    let config = load_prompts_from_str(&file_content).map_err(|e|
        format!("Failed to load prompts file '{}': {}", path, e)
    )?;
    info!("Loaded prompts from {}", path);
    Ok(Arc::new(config))
}

fn get_query_template<'a>(config: &'a PromptConfig, key: &str) -> Result<&'a str, PromptError> {
    config.query_templates
        .get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| PromptError::TemplateNotFound(format!("query_templates:{}", key)))
}

fn get_response_template<'a>(config: &'a PromptConfig, key: &str) -> Result<&'a str, PromptError> {
    config.response_templates
        .get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| PromptError::TemplateNotFound(format!("response_templates:{}", key)))
}

pub fn get_condense_prompt(
    config: &PromptConfig,
    chat_history: &str,
    question: &str
) -> Result<String, PromptError> {
    let template = get_query_template(config, CONDENSE_QUESTION)?;
    Ok(template.replace("{chat_history}", chat_history).replace("{question}", question))
}

pub fn get_answer_prompt(
    config: &PromptConfig,
    context: &str,
    question: &str
) -> Result<String, PromptError> {
    let template = get_response_template(config, CONTEXT_ANSWER)?;
    Ok(template.replace("{context}", context).replace("{question}", question))
}
