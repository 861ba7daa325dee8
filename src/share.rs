//! The share action: build the chatlog, publish it, hand back links.
use eyre::{Context, Result, eyre};

use crate::archive::ArchiveDocument;
use crate::builder::{ArchiveBuilder, AssetFailurePolicy, MessageRange};
use crate::error::{RangeInputError, UploadError};
use crate::importer::ChatContext;
use crate::publisher::{AssetPublisher, Notice};
use crate::transport::BlobTransport;

pub const READER_URL: &str = "https://sprites.neocities.org/logs/reader";

#[derive(Debug, Clone, Copy, Default)]
pub struct ShareRequest {
    pub range: Option<MessageRange>,
    pub force_fresh_character_upload: bool,
    pub policy: AssetFailurePolicy,
}

#[derive(Debug, Clone)]
pub struct ShareOutcome {
    pub chatlog_url: String,
    /// Web reader link for the published chatlog.
    pub reader_url: String,
    pub records: usize,
    pub assets: usize,
    pub notices: Vec<Notice>,
}

/// Parse a `start-end` range as typed by a user. Both bounds are inclusive.
pub fn parse_range(input: &str) -> Result<MessageRange, RangeInputError> {
    let invalid = || RangeInputError {
        input: input.to_string(),
    };
    let (start, end) = input.split_once('-').ok_or_else(invalid)?;
    let start = start.trim().parse::<i64>().map_err(|_| invalid())?;
    let end = end.trim().parse::<i64>().map_err(|_| invalid())?;
    Ok(MessageRange::inclusive(start, end))
}

pub fn reader_url(chatlog_url: &str) -> String {
    format!("{READER_URL}?log={}", urlencoding::encode(chatlog_url))
}

/// Build the archive for the requested range. Without a range, the whole chat.
pub fn build_document<T: BlobTransport>(
    context: &ChatContext,
    publisher: &mut AssetPublisher<T>,
    request: &ShareRequest,
) -> Result<ArchiveDocument> {
    let range = request.range.unwrap_or_else(|| {
        MessageRange::exclusive(0, i64::try_from(context.messages.len()).unwrap_or(i64::MAX))
    });
    let document = ArchiveBuilder::new(context, publisher)
        .with_policy(request.policy)
        .build(range, request.force_fresh_character_upload)
        .wrap_err("Failed to create chatlog")?;

    let unresolved = document.unresolved_refs();
    if !unresolved.is_empty() {
        let keys: Vec<&str> = unresolved.iter().map(|r| r.key()).collect();
        return Err(eyre!(
            "Chatlog references unknown assets: {}",
            keys.join(", ")
        ));
    }
    Ok(document)
}

/// Build, publish, and link. Notices from failed asset uploads stay on
/// `publisher` if this returns an error.
pub fn share<T: BlobTransport>(
    context: &ChatContext,
    publisher: &mut AssetPublisher<T>,
    request: &ShareRequest,
) -> Result<ShareOutcome> {
    let document = build_document(context, publisher, request)?;

    let chatlog_url = match publisher.publish_document(&document) {
        Ok(url) => url,
        Err(UploadError::UnconfiguredProxy) => {
            return Err(eyre!("Failed to get chatlog URL: no CORS proxy configured"));
        }
        Err(err) => return Err(err).wrap_err("Failed to share chatlog"),
    };

    Ok(ShareOutcome {
        reader_url: reader_url(&chatlog_url),
        chatlog_url,
        records: document.chat.len(),
        assets: document.image_mappings.len(),
        notices: publisher.take_notices(),
    })
}
