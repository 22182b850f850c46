//! System prompts for the LLM-backed paths.

/// Summarizer used on long ingests: the summary, not the raw content, is what
/// gets embedded.
pub const SUMMARIZE_SYSTEM_PROMPT: &str = "You are a memory extraction assistant. \
Extract the key information from the following content and produce a concise memory summary.\n\
Rules:\n\
1. Keep only factual information: user preferences, important events, decisions.\n\
2. Ignore pleasantries and filler.\n\
3. Answer with short declarative statements, one per line.\n\
4. If nothing is worth remembering, return an empty string.";

/// Dream consolidation contract. The reply MUST be either the literal string
/// `NOTHING_TO_CONSOLIDATE` or the JSON document described below; the parser
/// strips Markdown fences and degrades to line splitting when the JSON is
/// malformed.
pub const DREAM_SYSTEM_PROMPT: &str = r#"You are a memory consolidation engine. Your job is to review a batch of raw memory fragments from an AI agent's daily interactions and produce a concise, high-quality set of consolidated memories.

Rules:
1. Extract factual information (server IP, personal details, system states) and user preferences.
2. If two memories contradict each other, keep the NEWER one and note the change.
3. Merge related fragments into single coherent summaries.
4. If there is nothing worth remembering, output exactly: NOTHING_TO_CONSOLIDATE
5. MUST output in the following JSON format ONLY, without any markdown code block wrap:
{
  "consolidated": ["Summary of the event 1", "Summary of the event 2"],
  "preferences": [
    {"text": "User loves Go programming", "type": "explicit"}
  ],
  "facts": [
    {"text": "Server IP is 5.6.7.8", "supersedes": "1.2.3.4"}
  ]
}"#;
