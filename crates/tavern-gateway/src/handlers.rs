use tracing::debug;

use tavern_types::TavernError;
use tavern_types::events::{
    AudioStopped, CharacterBroadcast, ClientEvent, DiceBroadcast, NoteRemoved, ServerEvent, SketchBroadcast, Stamped,
};
use tavern_types::models::{DiceRoll, Sketch};

use crate::cache::keys;
use crate::gatekeeper::ConnectionBinding;
use crate::hub::SocketId;
use crate::notes::{self, NoteCaller};
use crate::{Gateway, blocking, dice};

/// Apply one client event. Authorization runs before any state is touched; an
/// `Err` is reported to the sender as an `error` event by the connection loop.
pub async fn handle(
    gateway: &Gateway,
    socket_id: SocketId,
    binding: &ConnectionBinding,
    event: ClientEvent,
) -> Result<(), TavernError> {
    let session_id = binding.session_id;

    match event {
        ClientEvent::SketchUpdate(sketch) => {
            let sketch = gateway.sketches.replace(binding, sketch).await?;
            relay_sketch(gateway, socket_id, binding, sketch).await;
        }

        ClientEvent::TokenUpdate(token) => {
            if let Some(sketch) = gateway.sketches.merge_token(binding, token).await? {
                relay_sketch(gateway, socket_id, binding, sketch).await;
            }
        }

        ClientEvent::DiceRequest(request) => {
            let event = roll(gateway, binding, &request).await?;
            gateway.hub.emit_to_room(session_id, &event, None).await;
        }

        ClientEvent::DicePrivateRequest(request) => {
            binding.require_master("roll privately")?;
            let event = roll(gateway, binding, &request).await?;
            gateway.hub.emit_to(socket_id, &event).await;
        }

        ClientEvent::NoteUpdate(request) => {
            let caller = NoteCaller::in_session(binding.user.id, session_id);
            let change = notes::update(&gateway.db, caller, request.note_id, request.patch).await?;
            if change.note.is_shared || change.was_shared {
                let event = ServerEvent::NoteUpdate(Stamped::now(change.note));
                gateway.hub.emit_to_room(session_id, &event, Some(socket_id)).await;
            }
        }

        ClientEvent::NoteDelete(request) => {
            let caller = NoteCaller::in_session(binding.user.id, session_id);
            let removed = notes::delete(&gateway.db, caller, request.note_id).await?;
            if removed.is_shared {
                let event = ServerEvent::NoteDelete(Stamped::now(NoteRemoved {
                    note_id: removed.id,
                    user_id: removed.user_id,
                }));
                gateway.hub.emit_to_room(session_id, &event, Some(socket_id)).await;
            }
        }

        ClientEvent::AudioPlay(request) => {
            binding.require_master("play audio")?;
            let event = ServerEvent::AudioPlay(Stamped::now(request));
            gateway.hub.emit_to_room(session_id, &event, Some(socket_id)).await;
        }

        ClientEvent::AudioStop => {
            binding.require_master("stop audio")?;
            let event = ServerEvent::AudioStop(Stamped::now(AudioStopped {}));
            gateway.hub.emit_to_room(session_id, &event, Some(socket_id)).await;
        }

        ClientEvent::CharacterUpdate => character_update(gateway, binding).await?,
    }

    Ok(())
}

async fn relay_sketch(gateway: &Gateway, socket_id: SocketId, binding: &ConnectionBinding, sketch: Sketch) {
    let event = ServerEvent::SketchUpdate(Stamped::now(SketchBroadcast {
        user: binding.user.clone(),
        is_master: binding.is_master(),
        sketch,
    }));
    gateway
        .hub
        .emit_to_room(binding.session_id, &event, Some(socket_id))
        .await;
}

async fn roll(gateway: &Gateway, binding: &ConnectionBinding, request: &[DiceRoll]) -> Result<ServerEvent, TavernError> {
    let result = dice::roll(request)?;
    debug!(
        "{} rolled {} dice in session {}: total {}",
        binding.user.name,
        request.len(),
        binding.session_id,
        result.total
    );
    Ok(ServerEvent::DiceResult(Stamped::now(DiceBroadcast {
        user: binding.user.clone(),
        is_master: binding.is_master(),
        character: gateway.character_of(binding).await,
        result,
    })))
}

/// Reload the player's character, refresh its cache entry and tell the master.
async fn character_update(gateway: &Gateway, binding: &ConnectionBinding) -> Result<(), TavernError> {
    let character_id = binding
        .character_id()
        .ok_or_else(|| TavernError::Forbidden("Only players have a character to update".into()))?;

    let character = blocking(&gateway.db, move |db| {
        db.get_character(character_id)?.map(|row| row.into_character()).transpose()
    })
    .await?
    .ok_or_else(|| TavernError::NotFound(format!("Character {character_id} not found")))?;

    gateway.cache.set_json(&keys::character(character_id), &character).await?;

    let master = gateway
        .hub
        .find_in_room(binding.session_id, |b| b.is_master())
        .await
        .ok_or_else(|| TavernError::Intern(format!("No master connected to session {}", binding.session_id)))?;

    let event = ServerEvent::CharacterUpdate(Stamped::now(CharacterBroadcast {
        user: binding.user.clone(),
        character,
    }));
    gateway.hub.emit_to(master, &event).await;
    Ok(())
}
