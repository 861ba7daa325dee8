//! Walks a message range and assembles the archive document.
use std::ops::Range;

use crate::archive::{
    ApiOrigin, ArchiveDocument, ArchiveRecord, AssetIndex, AssetRef, Avatar, CharacterSource,
    SCHEMA_VERSION, SourceKind,
};
use crate::error::UploadError;
use crate::importer::{Character, ChatContext, ChatMessage};
use crate::publisher::{AssetPublisher, asset_key};
use crate::transport::BlobTransport;

/// Speaker name the host gives its own messages.
pub const SYSTEM_SPEAKER: &str = "System";

const CATALOG_BASE: &str = "https://chub.ai";
const CATALOG_AVATAR_BASE: &str = "https://avatars.charhub.io/avatars";

/// What to do when a single asset fails to upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AssetFailurePolicy {
    /// Leave the reference out and keep building.
    #[default]
    Skip,
    /// Stop the build with the upload error.
    Abort,
}

/// Caller-supplied message bounds, before clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRange {
    start: i64,
    end: i64,
}

impl MessageRange {
    /// Both bounds included, as typed by a user (`3-7`).
    pub fn inclusive(start: i64, end: i64) -> Self {
        Self {
            start,
            end: end.saturating_add(1),
        }
    }

    /// End bound excluded.
    pub fn exclusive(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Clamp to a chat of `len` messages.
    ///
    /// Start is raised to 0 and end lowered to `len`; bounds that end up
    /// reversed are swapped. The result always indexes inside the chat.
    pub fn resolve(&self, len: usize) -> Range<usize> {
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let mut start = self.start.max(0);
        let mut end = self.end.min(len);
        if end < start {
            std::mem::swap(&mut start, &mut end);
        }
        let start = start.clamp(0, len) as usize;
        let end = end.clamp(0, len) as usize;
        start..end
    }
}

/// Asset key for a card on the external catalog: `creator/name` → `chub_creator_name`.
pub fn catalog_avatar_key(path: &str) -> String {
    format!("chub_{}", path.replacen('/', "_", 1))
}

pub fn catalog_avatar_url(path: &str) -> String {
    format!("{CATALOG_AVATAR_BASE}/{path}/chara_card_v2.png")
}

pub fn catalog_page_url(path: &str) -> String {
    format!("{CATALOG_BASE}/{path}")
}

fn settle<V>(
    policy: AssetFailurePolicy,
    result: Result<V, UploadError>,
) -> Result<Option<V>, UploadError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(UploadError::UnconfiguredProxy | UploadError::AlreadyFailed(_)) => Ok(None),
        Err(err) if policy == AssetFailurePolicy::Abort => Err(err),
        Err(_) => Ok(None),
    }
}

pub struct ArchiveBuilder<'a, T> {
    context: &'a ChatContext,
    publisher: &'a mut AssetPublisher<T>,
    policy: AssetFailurePolicy,
}

impl<'a, T: BlobTransport> ArchiveBuilder<'a, T> {
    pub fn new(context: &'a ChatContext, publisher: &'a mut AssetPublisher<T>) -> Self {
        Self {
            context,
            publisher,
            policy: AssetFailurePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: AssetFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Build the archive for `range`.
    ///
    /// With [`AssetFailurePolicy::Skip`] this never fails: failed uploads leave
    /// their references out. With `Abort` the first failed upload is returned.
    pub fn build(
        &mut self,
        range: MessageRange,
        force_fresh_character_upload: bool,
    ) -> Result<ArchiveDocument, UploadError> {
        let context = self.context;
        let span = range.resolve(context.messages.len());
        tracing::info!(
            start = span.start,
            end = span.end,
            total = context.messages.len(),
            "building chatlog"
        );

        let mut index = AssetIndex::seeded();
        let (character_source, character_key) =
            self.resolve_character(&context.character, &mut index, force_fresh_character_upload)?;

        let mut chat = Vec::with_capacity(span.len());
        for message in &context.messages[span] {
            let record = self.record(message, character_key.as_deref(), &mut index)?;
            chat.push(record);
        }

        Ok(ArchiveDocument {
            chat,
            character_source,
            image_mappings: index,
            version: SCHEMA_VERSION,
        })
    }

    fn resolve_character(
        &mut self,
        character: &Character,
        index: &mut AssetIndex,
        force_fresh_upload: bool,
    ) -> Result<(CharacterSource, Option<String>), UploadError> {
        if let Some(path) = character.chub_path.as_deref()
            && !force_fresh_upload
        {
            // Catalog avatar URL is derived, never uploaded.
            let key = catalog_avatar_key(path);
            index.register(&key, catalog_avatar_url(path));
            tracing::debug!(path, %key, "character card from catalog");
            return Ok((
                CharacterSource {
                    kind: SourceKind::ExternalCatalog,
                    full_path: Some(catalog_page_url(path)),
                },
                Some(key),
            ));
        }

        let card_path = character.card_path();
        let key = asset_key(&character.avatar).to_string();
        let uploaded = settle(self.policy, self.publisher.upload_file(&card_path, &key))?;
        let character_key = uploaded.as_ref().map(|url| {
            index.register(&key, url.clone());
            key
        });
        Ok((
            CharacterSource {
                kind: SourceKind::Uploaded,
                full_path: uploaded,
            },
            character_key,
        ))
    }

    fn record(
        &mut self,
        message: &ChatMessage,
        character_key: Option<&str>,
        index: &mut AssetIndex,
    ) -> Result<ArchiveRecord, UploadError> {
        let avatar = if message.is_user {
            match message.forced_avatar_path() {
                Some(path) => self.resolve(index, &path)?.into(),
                None => {
                    tracing::debug!(name = %message.name, "user message without avatar");
                    Avatar::Absent
                }
            }
        } else if message.name == SYSTEM_SPEAKER {
            // Name decides, not `is_system`: the flag is missing on some host messages.
            Avatar::Ref(AssetRef::system())
        } else {
            character_key.map_or(Avatar::Null, |key| Avatar::Ref(AssetRef::new(key)))
        };

        let image = match message.image() {
            Some(path) => self.resolve(index, path)?,
            None => None,
        };

        Ok(ArchiveRecord {
            name: message.name.clone(),
            mes: message.mes.clone(),
            is_user: message.is_user,
            is_system: message.is_system,
            api: ApiOrigin {
                source: message.api().map(str::to_string),
                model: message.model().map(str::to_string),
            },
            avatar,
            image,
        })
    }

    fn resolve(
        &mut self,
        index: &mut AssetIndex,
        path: &str,
    ) -> Result<Option<AssetRef>, UploadError> {
        settle(self.policy, self.publisher.resolve_asset(index, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::MessageExtra;
    use crate::publisher::tests::RecordingTransport;

    fn user(text: &str, avatar: &str) -> ChatMessage {
        ChatMessage {
            name: "You".into(),
            mes: text.into(),
            is_user: true,
            force_avatar: Some(avatar.into()),
            ..ChatMessage::default()
        }
    }

    fn bot(text: &str) -> ChatMessage {
        ChatMessage {
            name: "Seraphina".into(),
            mes: text.into(),
            extra: Some(MessageExtra {
                api: Some("openai".into()),
                model: Some("gpt-4o".into()),
                image: None,
            }),
            ..ChatMessage::default()
        }
    }

    fn system(text: &str, flag: bool) -> ChatMessage {
        ChatMessage {
            name: SYSTEM_SPEAKER.into(),
            mes: text.into(),
            is_system: flag,
            ..ChatMessage::default()
        }
    }

    fn context(messages: Vec<ChatMessage>, chub_path: Option<&str>) -> ChatContext {
        ChatContext {
            header: None,
            messages,
            character: Character {
                avatar: "Seraphina.png".into(),
                name: Some("Seraphina".into()),
                chub_path: chub_path.map(str::to_string),
            },
        }
    }

    fn numbered(n: usize) -> ChatContext {
        context((0..n).map(|i| bot(&i.to_string())).collect(), None)
    }

    fn build(
        ctx: &ChatContext,
        transport: RecordingTransport,
        range: MessageRange,
        force: bool,
    ) -> (ArchiveDocument, AssetPublisher<RecordingTransport>) {
        let mut publisher = AssetPublisher::new(transport);
        let doc = ArchiveBuilder::new(ctx, &mut publisher)
            .build(range, force)
            .unwrap();
        (doc, publisher)
    }

    fn texts(doc: &ArchiveDocument) -> Vec<&str> {
        doc.chat.iter().map(|r| r.mes.as_str()).collect()
    }

    #[test]
    fn inclusive_range_adds_one_to_end() {
        assert_eq!(MessageRange::inclusive(0, 2).resolve(10), 0..3);
        assert_eq!(MessageRange::inclusive(0, 9).resolve(10), 0..10);
        assert_eq!(MessageRange::inclusive(0, 50).resolve(10), 0..10);
    }

    #[test]
    fn reversed_inclusive_range_swaps_after_increment() {
        // end becomes 3 before the swap
        assert_eq!(MessageRange::inclusive(5, 2).resolve(10), 3..5);
    }

    #[test]
    fn exclusive_range_properties() {
        let len = 8;
        for start in 0..=len as i64 {
            for end in start..=len as i64 {
                let span = MessageRange::exclusive(start, end).resolve(len);
                assert_eq!(span.len() as i64, end - start);
                assert_eq!(
                    MessageRange::exclusive(end, start).resolve(len),
                    span,
                    "swap {start}..{end}"
                );
            }
        }
    }

    #[test]
    fn clamps_out_of_range_bounds() {
        assert_eq!(MessageRange::exclusive(-4, 3).resolve(10), 0..3);
        assert_eq!(MessageRange::exclusive(2, 99).resolve(10), 2..10);
        assert_eq!(MessageRange::exclusive(20, 30).resolve(10), 10..10);
        assert_eq!(MessageRange::exclusive(0, -5).resolve(10), 0..0);
        assert_eq!(MessageRange::inclusive(0, 0).resolve(0), 0..0);
    }

    #[test]
    fn builds_records_in_chat_order() {
        let ctx = numbered(10);
        let (doc, _) = build(&ctx, RecordingTransport::default(), MessageRange::exclusive(2, 5), false);
        assert_eq!(texts(&doc), vec!["2", "3", "4"]);

        let (reversed, _) =
            build(&ctx, RecordingTransport::default(), MessageRange::exclusive(5, 2), false);
        assert_eq!(texts(&reversed), texts(&doc));
    }

    #[test]
    fn copies_message_fields() {
        let ctx = numbered(1);
        let (doc, _) = build(&ctx, RecordingTransport::default(), MessageRange::inclusive(0, 0), false);
        let record = &doc.chat[0];
        assert_eq!(record.name, "Seraphina");
        assert!(!record.is_user);
        assert_eq!(record.api.source.as_deref(), Some("openai"));
        assert_eq!(record.api.model.as_deref(), Some("gpt-4o"));
        assert_eq!(record.image, None);
    }

    #[test]
    fn end_to_end_uploaded_character() {
        let ctx = context(
            vec![user("hi", "User Avatars/me.png"), bot("hello"), system("note", false)],
            None,
        );
        let (doc, publisher) =
            build(&ctx, RecordingTransport::default(), MessageRange::inclusive(0, 2), false);

        assert_eq!(doc.version, 1);
        assert_eq!(doc.character_source.kind, SourceKind::Uploaded);
        assert_eq!(
            doc.character_source.full_path.as_deref(),
            Some("https://files.example/Seraphina.png")
        );
        let keys: Vec<&String> = doc.image_mappings.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["Seraphina.png", "me.png", "system"]);

        let avatars: Vec<&str> = doc
            .chat
            .iter()
            .map(|r| r.avatar.asset().unwrap().as_str())
            .collect();
        assert_eq!(
            avatars,
            vec!["IMAGE_MAP:me.png", "IMAGE_MAP:Seraphina.png", "IMAGE_MAP:system"]
        );
        assert!(doc.unresolved_refs().is_empty());
        assert_eq!(publisher.transport().uploads_of("/characters/Seraphina.png"), 1);

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["character_source"]["type"], "catbox");
    }

    #[test]
    fn catalog_character_is_not_uploaded() {
        let ctx = context(vec![bot("hello")], Some("creator/seraphina"));
        let (doc, publisher) =
            build(&ctx, RecordingTransport::default(), MessageRange::inclusive(0, 0), false);

        assert!(publisher.transport().files.borrow().is_empty());
        assert_eq!(
            doc.character_source,
            CharacterSource {
                kind: SourceKind::ExternalCatalog,
                full_path: Some("https://chub.ai/creator/seraphina".into()),
            }
        );
        let entry = doc.image_mappings.get("chub_creator_seraphina").unwrap();
        assert_eq!(
            entry.url,
            "https://avatars.charhub.io/avatars/creator/seraphina/chara_card_v2.png"
        );
        assert_eq!(
            doc.chat[0].avatar,
            Avatar::Ref(AssetRef::new("chub_creator_seraphina"))
        );
    }

    #[test]
    fn forced_upload_ignores_catalog() {
        let ctx = context(vec![bot("hello")], Some("creator/seraphina"));
        let (doc, publisher) =
            build(&ctx, RecordingTransport::default(), MessageRange::inclusive(0, 0), true);
        assert_eq!(doc.character_source.kind, SourceKind::Uploaded);
        assert_eq!(publisher.transport().uploads_of("/characters/Seraphina.png"), 1);
        assert!(!doc.image_mappings.contains("chub_creator_seraphina"));
    }

    #[test]
    fn system_detection_uses_name_not_flag() {
        let mut flagged_bot = bot("narration");
        flagged_bot.is_system = true;
        let ctx = context(
            vec![system("a", false), system("b", true), flagged_bot],
            None,
        );
        let (doc, _) = build(&ctx, RecordingTransport::default(), MessageRange::inclusive(0, 2), false);
        assert_eq!(doc.chat[0].avatar, Avatar::Ref(AssetRef::system()));
        assert_eq!(doc.chat[1].avatar, Avatar::Ref(AssetRef::system()));
        assert_eq!(doc.chat[2].avatar, Avatar::Ref(AssetRef::new("Seraphina.png")));
    }

    #[test]
    fn user_named_system_still_uses_own_avatar() {
        let mut msg = user("hi", "User Avatars/me.png");
        msg.name = SYSTEM_SPEAKER.into();
        let ctx = context(vec![msg], None);
        let (doc, _) = build(&ctx, RecordingTransport::default(), MessageRange::inclusive(0, 0), false);
        assert_eq!(doc.chat[0].avatar, Avatar::Ref(AssetRef::new("me.png")));
    }

    #[test]
    fn failed_user_avatar_is_absent_not_character() {
        let ctx = context(vec![user("hi", "User Avatars/me.png"), bot("yo")], None);
        let transport = RecordingTransport::failing(&["/User Avatars/me.png"]);
        let (doc, publisher) = build(&ctx, transport, MessageRange::inclusive(0, 1), false);

        assert_eq!(doc.chat.len(), 2);
        assert_eq!(doc.chat[0].avatar, Avatar::Absent);
        assert_eq!(doc.chat[1].avatar, Avatar::Ref(AssetRef::new("Seraphina.png")));
        assert_eq!(publisher.notices().len(), 1);
        assert!(doc.unresolved_refs().is_empty());
    }

    #[test]
    fn failed_card_upload_leaves_ai_avatar_null() {
        let ctx = context(vec![bot("yo")], None);
        let transport = RecordingTransport::failing(&["/characters/Seraphina.png"]);
        let (doc, _) = build(&ctx, transport, MessageRange::inclusive(0, 0), false);

        assert_eq!(doc.character_source.full_path, None);
        assert_eq!(doc.chat[0].avatar, Avatar::Null);
        assert_eq!(doc.image_mappings.len(), 1);
    }

    #[test]
    fn inline_images_are_deduplicated() {
        let mut first = bot("look");
        first.extra.as_mut().unwrap().image = Some("/user/images/Seraphina/cat.png".into());
        let mut second = bot("again");
        second.extra.as_mut().unwrap().image = Some("/user/images/Seraphina/cat.png".into());
        let ctx = context(vec![first, bot("none"), second], None);

        let (doc, publisher) =
            build(&ctx, RecordingTransport::default(), MessageRange::inclusive(0, 2), false);
        assert_eq!(doc.chat[0].image, Some(AssetRef::new("cat.png")));
        assert_eq!(doc.chat[1].image, None);
        assert_eq!(doc.chat[2].image, Some(AssetRef::new("cat.png")));
        assert_eq!(
            publisher.transport().uploads_of("/user/images/Seraphina/cat.png"),
            1
        );
    }

    #[test]
    fn failed_inline_image_is_uploaded_once() {
        let shared = "/user/images/cat.png";
        let messages = (0..3)
            .map(|i| {
                let mut msg = bot(&i.to_string());
                msg.extra.as_mut().unwrap().image = Some(shared.into());
                msg
            })
            .collect();
        let ctx = context(messages, None);

        let (doc, publisher) = build(
            &ctx,
            RecordingTransport::failing(&[shared]),
            MessageRange::inclusive(0, 2),
            false,
        );
        assert_eq!(publisher.transport().uploads_of(shared), 1);
        assert_eq!(publisher.notices().len(), 1);
        assert!(doc.chat.iter().all(|r| r.image.is_none()));
        assert_eq!(doc.chat.len(), 3);
        assert!(doc.unresolved_refs().is_empty());
    }

    #[test]
    fn failed_card_is_not_retried_for_same_file_name() {
        let mut msg = bot("look");
        msg.extra.as_mut().unwrap().image = Some("/user/images/Seraphina.png".into());
        let ctx = context(vec![msg], None);
        let (doc, publisher) = build(
            &ctx,
            RecordingTransport::failing(&["/characters/Seraphina.png"]),
            MessageRange::inclusive(0, 0),
            false,
        );
        assert_eq!(publisher.transport().uploads_of("/user/images/Seraphina.png"), 0);
        assert_eq!(publisher.notices().len(), 1);
        assert_eq!(doc.chat[0].image, None);
        assert_eq!(doc.chat[0].avatar, Avatar::Null);
    }

    #[test]
    fn abort_policy_stops_on_first_failure() {
        let ctx = context(vec![user("hi", "User Avatars/me.png"), bot("yo")], None);
        let mut publisher =
            AssetPublisher::new(RecordingTransport::failing(&["/User Avatars/me.png"]));
        let err = ArchiveBuilder::new(&ctx, &mut publisher)
            .with_policy(AssetFailurePolicy::Abort)
            .build(MessageRange::inclusive(0, 1), false)
            .unwrap_err();
        assert!(matches!(err, UploadError::Transport(_)));
    }

    #[test]
    fn abort_policy_tolerates_unconfigured_proxy() {
        let ctx = context(vec![user("hi", "User Avatars/me.png")], None);
        let mut publisher = AssetPublisher::new(RecordingTransport {
            unconfigured: true,
            ..RecordingTransport::default()
        });
        let doc = ArchiveBuilder::new(&ctx, &mut publisher)
            .with_policy(AssetFailurePolicy::Abort)
            .build(MessageRange::inclusive(0, 0), false)
            .unwrap();
        assert_eq!(doc.chat[0].avatar, Avatar::Absent);
        assert_eq!(doc.character_source.full_path, None);
    }

    #[test]
    fn catalog_key_replaces_first_separator_only() {
        assert_eq!(catalog_avatar_key("creator/name"), "chub_creator_name");
        assert_eq!(catalog_avatar_key("a/b/c"), "chub_a_b/c");
    }
}
