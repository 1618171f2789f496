use crate::contacts::{display_name, ContactIndex};
use crate::models::ConversationBundle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    pub participants_resolved: usize,
    pub senders_resolved: usize,
}

/// Replaces participant handles with contact names and fills `sender_name` on
/// incoming messages. Handles without a matching contact are left as they are.
pub fn resolve_identities(bundles: &mut [ConversationBundle], index: &ContactIndex) -> ResolveStats {
    let mut stats = ResolveStats::default();
    if index.is_empty() {
        return stats;
    }
    for bundle in bundles.iter_mut() {
        for participant in bundle.conversation.participants.iter_mut() {
            if let Some(name) = resolve_handle(index, participant) {
                *participant = name;
                stats.participants_resolved += 1;
            }
        }
        for message in bundle.messages.iter_mut() {
            if message.is_from_me {
                continue;
            }
            let Some(handle) = message.handle.as_deref() else {
                continue;
            };
            if let Some(name) = resolve_handle(index, handle) {
                message.sender_name = Some(name);
                stats.senders_resolved += 1;
            }
        }
    }
    stats
}

fn resolve_handle(index: &ContactIndex, handle: &str) -> Option<String> {
    let (contact, _) = index.lookup(handle)?;
    display_name(contact).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Contact, Conversation, Message, MessageChannel};

    fn message(id: i64, handle: Option<&str>, is_from_me: bool) -> Message {
        Message {
            id,
            guid: format!("msg-{id}"),
            text: Some("hi".to_string()),
            transcript: None,
            handle: handle.map(str::to_string),
            sender_name: None,
            is_from_me,
            sent_at: None,
            read_at: None,
            delivered_at: None,
            channel: MessageChannel::IMessage,
            attachments: Vec::new(),
        }
    }

    fn bundle() -> ConversationBundle {
        ConversationBundle {
            conversation: Conversation {
                chat_id: 1,
                guid: None,
                chat_identifier: "chat42".to_string(),
                display_name: None,
                service_name: Some("iMessage".to_string()),
                participants: vec!["+15550001111".to_string(), "stranger@example.com".to_string()],
                is_group: true,
                last_message_at: None,
            },
            messages: vec![
                message(1, Some("+15550001111"), false),
                message(2, Some("stranger@example.com"), false),
                message(3, Some("+15550001111"), true),
            ],
        }
    }

    #[test]
    fn known_handles_become_names_and_unknown_pass_through() {
        let index = ContactIndex::new(vec![Contact {
            record_id: "7".to_string(),
            display_name: Some("Alice".to_string()),
            phones: vec!["5550001111".to_string()],
            ..Contact::default()
        }]);
        let mut bundles = vec![bundle()];
        let stats = resolve_identities(&mut bundles, &index);

        let resolved = &bundles[0];
        assert_eq!(resolved.conversation.participants, vec!["Alice", "stranger@example.com"]);
        assert_eq!(resolved.messages[0].sender_name.as_deref(), Some("Alice"));
        assert_eq!(resolved.messages[1].sender_name, None);
        assert_eq!(resolved.messages[2].sender_name, None);
        assert_eq!(resolved.messages[1].handle.as_deref(), Some("stranger@example.com"));
        assert_eq!(
            stats,
            ResolveStats {
                participants_resolved: 1,
                senders_resolved: 1
            }
        );
    }

    #[test]
    fn empty_index_changes_nothing() {
        let mut bundles = vec![bundle()];
        let before = bundles.clone();
        resolve_identities(&mut bundles, &ContactIndex::default());
        assert_eq!(bundles, before);
    }
}
