//! Type definitions and loaders for the host chat application's on-disk data.
//!
//! Chats are stored as JSON Lines: one header object followed by one object per
//! message. Character cards are PNG files carrying the card JSON base64-encoded
//! in a `tEXt` chunk (`chara`, or `ccv3` for v3 cards), or plain `.json` cards.
//!
//! Only the fields the chatlog archive consumes are modelled; everything else
//! in the host format is ignored on read.
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Chat file
// ---------------------------------------------------------------------------

/// First line of a chat file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatHeader {
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub character_name: Option<String>,
    #[serde(default)]
    pub create_date: Option<String>,
}

/// A single chat message as the host application stores it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker name. `"System"` marks host-generated messages.
    #[serde(default)]
    pub name: String,
    pub mes: String,
    #[serde(default)]
    pub is_user: bool,
    /// Set for some, but not all, host-generated messages.
    #[serde(default)]
    pub is_system: bool,
    /// Server-relative avatar path (without leading slash) for user messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<MessageExtra>,
}

/// Provenance and attachments of a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageExtra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Server-relative path of an inline image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|s| !s.is_empty())
}

impl ChatMessage {
    pub fn api(&self) -> Option<&str> {
        non_empty(self.extra.as_ref().and_then(|e| e.api.as_ref()))
    }

    pub fn model(&self) -> Option<&str> {
        non_empty(self.extra.as_ref().and_then(|e| e.model.as_ref()))
    }

    pub fn image(&self) -> Option<&str> {
        non_empty(self.extra.as_ref().and_then(|e| e.image.as_ref()))
    }

    /// Server-relative reference to the user's avatar for this message.
    pub fn forced_avatar_path(&self) -> Option<String> {
        non_empty(self.force_avatar.as_ref()).map(|p| format!("/{p}"))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChatLine {
    Message(ChatMessage),
    Header(ChatHeader),
}

/// Parsed chat file.
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    pub header: Option<ChatHeader>,
    pub messages: Vec<ChatMessage>,
}

/// Read a JSON Lines chat file.
pub fn load_chat(path: &Path) -> Result<ChatLog> {
    let file =
        File::open(path).wrap_err_with(|| format!("Failed to open chat: {}", path.display()))?;
    parse_chat(BufReader::new(file))
        .wrap_err_with(|| format!("Failed to parse chat: {}", path.display()))
}

pub fn parse_chat<R: BufRead>(reader: R) -> Result<ChatLog> {
    let mut chat = ChatLog::default();
    let mut first_entry = true;
    for (idx, line) in reader.lines().enumerate() {
        let line = line.wrap_err("Failed to read line")?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: ChatLine = serde_json::from_str(&line)
            .wrap_err_with(|| format!("Malformed chat entry on line {}", idx + 1))?;
        // Only the first non-blank line may be the header.
        let is_first = std::mem::replace(&mut first_entry, false);
        match parsed {
            ChatLine::Message(message) => chat.messages.push(message),
            ChatLine::Header(header) if is_first => chat.header = Some(header),
            ChatLine::Header(_) => {
                return Err(eyre!("Line {} is not a chat message", idx + 1));
            }
        }
    }
    Ok(chat)
}

// ---------------------------------------------------------------------------
// Character card
// ---------------------------------------------------------------------------

/// The active character, as far as the archive is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Character {
    /// Card file name, e.g. `Seraphina.png`.
    pub avatar: String,
    pub name: Option<String>,
    /// `creator/slug` path of the card on the external catalog, if it came from there.
    pub chub_path: Option<String>,
}

impl Character {
    /// Server-relative reference to the card file.
    pub fn card_path(&self) -> String {
        format!("/characters/{}", self.avatar)
    }
}

#[derive(Deserialize, Default)]
struct CardJson {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    data: CardData,
}

#[derive(Deserialize, Default)]
struct CardData {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    extensions: CardExtensions,
}

#[derive(Deserialize, Default)]
struct CardExtensions {
    #[serde(default)]
    chub: Option<ChubExtension>,
}

#[derive(Deserialize, Default)]
struct ChubExtension {
    #[serde(default)]
    full_path: Option<String>,
}

const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// Load a character card (`.png` or `.json`).
pub fn load_character(path: &Path) -> Result<Character> {
    let avatar = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| eyre!("Character card path has no file name: {}", path.display()))?;

    let bytes =
        fs::read(path).wrap_err_with(|| format!("Failed to read card: {}", path.display()))?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let card = if is_json {
        Some(serde_json::from_slice::<CardJson>(&bytes).wrap_err("Failed to parse card JSON")?)
    } else {
        match read_card_text(&bytes)? {
            Some(encoded) => {
                let decoded = BASE64
                    .decode(encoded.trim())
                    .wrap_err("Card metadata is not valid base64")?;
                Some(
                    serde_json::from_slice::<CardJson>(&decoded)
                        .wrap_err("Failed to parse embedded card JSON")?,
                )
            }
            None => {
                tracing::debug!(card = %path.display(), "card carries no metadata chunk");
                None
            }
        }
    };

    let card = card.unwrap_or_default();
    Ok(Character {
        avatar,
        name: card.data.name.or(card.name),
        chub_path: card
            .data
            .extensions
            .chub
            .and_then(|c| c.full_path)
            .filter(|p| !p.is_empty()),
    })
}

/// Find the embedded card text in a PNG. `ccv3` wins over `chara` when both exist.
fn read_card_text(bytes: &[u8]) -> Result<Option<String>> {
    if bytes.len() < PNG_SIGNATURE.len() || &bytes[..8] != PNG_SIGNATURE {
        return Err(eyre!("Character card is not a PNG file"));
    }

    let mut chara = None;
    let mut pos = 8usize;
    while pos + 8 <= bytes.len() {
        let len = u32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
            as usize;
        let kind = &bytes[pos + 4..pos + 8];
        let data_start = pos + 8;
        let data_end = data_start
            .checked_add(len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| eyre!("Truncated PNG chunk at offset {}", pos))?;

        if kind == b"tEXt" {
            let data = &bytes[data_start..data_end];
            if let Some(nul) = data.iter().position(|b| *b == 0) {
                let keyword = &data[..nul];
                // tEXt is Latin-1; base64 payloads are plain ASCII.
                let text: String = data[nul + 1..].iter().map(|b| *b as char).collect();
                if keyword.eq_ignore_ascii_case(b"ccv3") {
                    return Ok(Some(text));
                }
                if keyword.eq_ignore_ascii_case(b"chara") {
                    chara = Some(text);
                }
            }
        } else if kind == b"IEND" {
            break;
        }
        // data + 4 byte CRC
        pos = data_end + 4;
    }
    Ok(chara)
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Read-only view of the active chat handed to the archive builder.
#[derive(Debug, Clone, Default)]
pub struct ChatContext {
    pub header: Option<ChatHeader>,
    pub messages: Vec<ChatMessage>,
    pub character: Character,
}

impl ChatContext {
    pub fn new(chat: ChatLog, character: Character) -> Self {
        Self {
            header: chat.header,
            messages: chat.messages,
            character,
        }
    }

    pub fn load(chat_path: &Path, card_path: &Path) -> Result<Self> {
        let chat = load_chat(chat_path)?;
        let character = load_character(card_path)?;
        Ok(Self::new(chat, character))
    }

    /// Name to show for the character: chat header, then card, then card file.
    pub fn character_display_name(&self) -> &str {
        self.header
            .as_ref()
            .and_then(|h| h.character_name.as_deref())
            .filter(|name| !name.trim().is_empty())
            .or(self.character.name.as_deref())
            .unwrap_or(&self.character.avatar)
    }
}
