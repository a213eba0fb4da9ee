//! Group rekeying.
//!
//! A group is a set of peers sharing a symmetric key per epoch. The admin
//! (the creator) generates every key and delivers it to each member over that
//! member's established pairwise session. Removing a member is a rotation: a
//! fresh random key goes to the remaining members only, so the removed member
//! never receives it.
//!
//! # Epochs
//!
//! ```text
//! create_group ──> epoch 0 ──rotate──> epoch 1 ──rotate──> epoch 2 ...
//!                     │                   │
//!                     └─ retired ─────────┴─ decrypts late frames until tick() prunes it
//! ```
//!
//! Each member encrypts with its own key derived from the epoch key, so
//! members never share a (key, nonce) pair. Each epoch keeps one replay window
//! per sender.

use std::{
    collections::{BTreeSet, HashMap, VecDeque, hash_map::Entry},
    fmt,
    ops::Sub,
    time::{Duration, Instant},
};

use bytes::Bytes;
use pqlan_crypto::{
    ChannelNamespace, Fingerprint, ReceiveWindow, SymmetricKey, aead, derive_group_sender_key,
    derivation::KEY_SIZE,
};
use pqlan_proto::{GroupDataFrame, GroupKey, InnerMessage, MAX_GROUP_MEMBERS, Message};
use zeroize::Zeroizing;

use crate::{channel::SessionTable, env::Environment, error::GroupError};

/// How long a retired epoch stays decryptable.
pub const DEFAULT_EPOCH_RETENTION: Duration = Duration::from_secs(30);

/// Maximum retired epochs kept per group.
pub const DEFAULT_MAX_RETIRED_EPOCHS: usize = 2;

/// Random 16-byte group identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId([u8; 16]);

impl GroupId {
    /// Wrap raw identifier bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw identifier bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", hex::encode(&self.0[..4]))
    }
}

/// Group configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    /// How long a retired epoch keeps decrypting late frames
    pub epoch_retention: Duration,
    /// Upper bound on retired epochs per group
    pub max_retired_epochs: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            epoch_retention: DEFAULT_EPOCH_RETENTION,
            max_retired_epochs: DEFAULT_MAX_RETIRED_EPOCHS,
        }
    }
}

/// Delivers a sealed group key to one member.
///
/// Implementations seal with the member's established pairwise session.
pub trait GroupKeyCourier {
    /// True if an established session with `peer` exists.
    fn has_session(&self, peer: &Fingerprint) -> bool;

    /// Seal `message` for `peer` and hand it to the transport.
    ///
    /// # Errors
    ///
    /// - `GroupError::NoSession` if the session disappeared
    /// - `GroupError::Channel` if sealing fails
    fn deliver(&mut self, peer: &Fingerprint, message: InnerMessage) -> Result<(), GroupError>;
}

impl GroupKeyCourier for SessionTable {
    fn has_session(&self, peer: &Fingerprint) -> bool {
        self.get(peer).is_some_and(crate::channel::Session::is_established)
    }

    fn deliver(&mut self, peer: &Fingerprint, message: InnerMessage) -> Result<(), GroupError> {
        let session = self.get_mut(peer).ok_or(GroupError::NoSession(*peer))?;
        let frame = session.seal_message(&message)?;
        self.enqueue(*peer, frame);
        Ok(())
    }
}

/// Per-sender receive state within one epoch.
#[derive(Debug)]
struct SenderState {
    key: SymmetricKey,
    window: ReceiveWindow,
}

/// One epoch of a group: its key, members and counters.
#[derive(Debug)]
pub struct GroupEpoch {
    group_id: GroupId,
    epoch: u32,
    admin: Fingerprint,
    /// Sorted, includes the admin
    members: Vec<Fingerprint>,
    key: SymmetricKey,
    local: Fingerprint,
    send_key: SymmetricKey,
    send_counter: u64,
    senders: HashMap<Fingerprint, SenderState>,
}

impl GroupEpoch {
    fn new(
        group_id: GroupId,
        epoch: u32,
        admin: Fingerprint,
        members: Vec<Fingerprint>,
        key: SymmetricKey,
        local: Fingerprint,
    ) -> Self {
        let send_key = derive_group_sender_key(&key, group_id.as_bytes(), epoch, &local);
        Self {
            group_id,
            epoch,
            admin,
            members,
            key,
            local,
            send_key,
            send_counter: 0,
            senders: HashMap::new(),
        }
    }

    /// Group identifier.
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Epoch number.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Fingerprint of the member that distributes keys.
    pub fn admin(&self) -> Fingerprint {
        self.admin
    }

    /// Members of this epoch, sorted.
    pub fn members(&self) -> &[Fingerprint] {
        &self.members
    }

    /// Is `peer` a member of this epoch?
    pub fn is_member(&self, peer: &Fingerprint) -> bool {
        self.members.binary_search(peer).is_ok()
    }

    fn key_message(&self) -> InnerMessage {
        InnerMessage::GroupKey(GroupKey {
            group_id: *self.group_id.as_bytes(),
            epoch: self.epoch,
            key: self.key.clone(),
            members: self.members.clone(),
        })
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<GroupDataFrame, GroupError> {
        let counter = self.send_counter;
        let next = counter.checked_add(1).ok_or(GroupError::CounterExhausted)?;

        let aad = GroupDataFrame::aad(self.group_id.as_bytes(), self.epoch, &self.local, counter);
        let sealed = aead::seal(
            &self.send_key,
            ChannelNamespace::Group,
            self.epoch,
            counter,
            &aad,
            plaintext,
        );
        self.send_counter = next;

        Ok(GroupDataFrame {
            group_id: *self.group_id.as_bytes(),
            epoch: self.epoch,
            sender: self.local,
            counter,
            ciphertext: Bytes::from(sealed.ciphertext),
            tag: sealed.tag,
        })
    }

    fn decrypt(&mut self, frame: &GroupDataFrame) -> Result<Vec<u8>, GroupError> {
        if !self.is_member(&frame.sender) {
            return Err(GroupError::NotAMember(frame.sender));
        }

        let (key, group_id, epoch) = (&self.key, &self.group_id, self.epoch);
        let sender = self.senders.entry(frame.sender).or_insert_with(|| SenderState {
            key: derive_group_sender_key(key, group_id.as_bytes(), epoch, &frame.sender),
            window: ReceiveWindow::new(),
        });

        sender.window.check(frame.counter)?;

        let aad = GroupDataFrame::aad(&frame.group_id, frame.epoch, &frame.sender, frame.counter);
        let plaintext = aead::open(
            &sender.key,
            ChannelNamespace::Group,
            frame.epoch,
            frame.counter,
            &aad,
            &frame.ciphertext,
            &frame.tag,
        )
        .map_err(|_| GroupError::Authentication)?;

        sender.window.accept(frame.counter)?;
        Ok(plaintext)
    }
}

struct GroupState<I> {
    current: GroupEpoch,
    /// Oldest first, with the time each was retired
    retired: VecDeque<(GroupEpoch, I)>,
    /// Members still owed the current key (admin only)
    undelivered: BTreeSet<Fingerprint>,
}

/// All groups this node belongs to.
///
/// Shared by every connection task behind one mutex; no method blocks or
/// awaits. Generic over `Instant` to support virtual time in tests.
pub struct GroupManager<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    local: Fingerprint,
    config: GroupConfig,
    groups: HashMap<GroupId, GroupState<I>>,
}

impl<I> GroupManager<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create an empty manager for the local identity.
    pub fn new(local: Fingerprint, config: GroupConfig) -> Self {
        Self { local, config, groups: HashMap::new() }
    }

    /// Current epoch of a group.
    pub fn group(&self, group_id: &GroupId) -> Option<&GroupEpoch> {
        self.groups.get(group_id).map(|state| &state.current)
    }

    /// Identifiers of every group.
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.groups.keys().copied().collect()
    }

    /// Create a group with the local node as admin and deliver epoch 0.
    ///
    /// Every member must have an established session; otherwise nothing is
    /// sent. Once keys go out the group exists, even if some copies could not
    /// be handed to the courier. Those members are listed by
    /// [`Self::undelivered`] and retried by [`Self::redeliver`].
    ///
    /// # Errors
    ///
    /// - `GroupError::NoMembers` if `members` names nobody but us
    /// - `GroupError::TooManyMembers` past the wire limit
    /// - `GroupError::NoSession` if a member is not connected
    pub fn create_group<C: GroupKeyCourier, E: Environment>(
        &mut self,
        members: &[Fingerprint],
        courier: &mut C,
        env: &E,
    ) -> Result<&GroupEpoch, GroupError> {
        let members = self.normalize_members(members)?;
        self.check_sessions(&members, courier)?;

        let group_id = loop {
            let id = GroupId(env.random_id());
            if !self.groups.contains_key(&id) {
                break id;
            }
        };

        let key = random_key(env);
        let epoch = GroupEpoch::new(group_id, 0, self.local, members, key, self.local);
        let undelivered = self.distribute(&epoch, courier);

        tracing::info!("Created group {} with {} members", group_id, epoch.members.len());
        let state = self.groups.entry(group_id).or_insert(GroupState {
            current: epoch,
            retired: VecDeque::new(),
            undelivered,
        });
        Ok(&state.current)
    }

    /// Start a new epoch with a fresh key for `new_members` (admin only).
    ///
    /// The new key is random, never derived from the old one. Members left
    /// out of `new_members` receive nothing. The old epoch is retired and
    /// still decrypts late frames until pruned.
    ///
    /// The new epoch is committed as soon as any key leaves, so a later
    /// rotation never reuses its number. Members whose copy was not handed
    /// off are retried by [`Self::redeliver`].
    ///
    /// # Errors
    ///
    /// - `GroupError::UnknownGroup` if the group does not exist
    /// - `GroupError::NotAdmin` if the local node is not the admin
    /// - `GroupError::CounterExhausted` if the epoch number would overflow
    /// - Same as [`Self::create_group`] for members and delivery
    pub fn rotate<C: GroupKeyCourier, E: Environment>(
        &mut self,
        group_id: &GroupId,
        new_members: &[Fingerprint],
        courier: &mut C,
        env: &E,
        now: I,
    ) -> Result<&GroupEpoch, GroupError> {
        let state = self.groups.get(group_id).ok_or(GroupError::UnknownGroup(*group_id))?;
        if state.current.admin != self.local {
            return Err(GroupError::NotAdmin { group: *group_id, from: self.local });
        }
        let next = state.current.epoch.checked_add(1).ok_or(GroupError::CounterExhausted)?;

        let members = self.normalize_members(new_members)?;
        self.check_sessions(&members, courier)?;

        let key = random_key(env);
        let epoch = GroupEpoch::new(*group_id, next, self.local, members, key, self.local);
        let undelivered = self.distribute(&epoch, courier);

        tracing::info!("Rotated group {} to epoch {}", group_id, next);
        Ok(self.advance(group_id, epoch, undelivered, now))
    }

    /// Install a key received from `from` over its pairwise session.
    ///
    /// The first key seen for a group makes `from` its admin. Later keys must
    /// come from that admin and strictly advance the epoch.
    ///
    /// # Errors
    ///
    /// - `GroupError::NotAMember` if the local node or `from` is not listed
    /// - `GroupError::NotAdmin` if `from` is not the group's admin
    /// - `GroupError::StaleEpoch` if the epoch does not advance
    /// - `GroupError::TooManyMembers` past the wire limit
    pub fn install_group_key(
        &mut self,
        from: &Fingerprint,
        group_key: GroupKey,
        now: I,
    ) -> Result<&GroupEpoch, GroupError> {
        let group_id = GroupId(group_key.group_id);

        let members: Vec<Fingerprint> =
            group_key.members.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        if members.len() > MAX_GROUP_MEMBERS {
            return Err(GroupError::TooManyMembers(members.len()));
        }
        if members.binary_search(&self.local).is_err() {
            return Err(GroupError::NotAMember(self.local));
        }
        if members.binary_search(from).is_err() {
            return Err(GroupError::NotAMember(*from));
        }

        let GroupKey { epoch, key, .. } = group_key;
        let installed = GroupEpoch::new(group_id, epoch, *from, members, key, self.local);

        if let Some(state) = self.groups.get(&group_id) {
            if state.current.admin != *from {
                tracing::warn!("Group key for {} from non-admin {}", group_id, from.short());
                return Err(GroupError::NotAdmin { group: group_id, from: *from });
            }
            if epoch <= state.current.epoch {
                return Err(GroupError::StaleEpoch {
                    group: group_id,
                    current: state.current.epoch,
                    received: epoch,
                });
            }

            tracing::debug!("Group {} advanced to epoch {}", group_id, epoch);
            return Ok(self.advance(&group_id, installed, BTreeSet::new(), now));
        }

        tracing::info!("Joined group {} at epoch {} (admin {})", group_id, epoch, from.short());
        let state = self.groups.entry(group_id).or_insert(GroupState {
            current: installed,
            retired: VecDeque::new(),
            undelivered: BTreeSet::new(),
        });
        Ok(&state.current)
    }

    /// Encrypt `plaintext` to the current epoch of a group.
    ///
    /// # Errors
    ///
    /// - `GroupError::UnknownGroup` if the group does not exist
    /// - `GroupError::CounterExhausted` if the send counter would overflow
    pub fn encrypt_to_group(
        &mut self,
        group_id: &GroupId,
        plaintext: &[u8],
    ) -> Result<Message, GroupError> {
        let state = self.groups.get_mut(group_id).ok_or(GroupError::UnknownGroup(*group_id))?;
        Ok(Message::GroupData(state.current.encrypt(plaintext)?))
    }

    /// Decrypt a GROUP_DATA frame under the epoch it names.
    ///
    /// Retired epochs still decrypt until pruned.
    ///
    /// # Errors
    ///
    /// - `GroupError::UnknownGroup` / `UnknownEpoch` if the key is not held
    /// - `GroupError::NotAMember` if the sender is not in that epoch
    /// - `GroupError::Authentication` if the tag does not verify
    /// - `GroupError::Replay` if the counter was seen or is below the window
    pub fn decrypt_from_group(&mut self, frame: &GroupDataFrame) -> Result<Vec<u8>, GroupError> {
        let group_id = GroupId(frame.group_id);
        let state = self.groups.get_mut(&group_id).ok_or(GroupError::UnknownGroup(group_id))?;

        let epoch = if state.current.epoch == frame.epoch {
            &mut state.current
        } else {
            state
                .retired
                .iter_mut()
                .map(|(epoch, _)| epoch)
                .find(|epoch| epoch.epoch == frame.epoch)
                .ok_or(GroupError::UnknownEpoch { group: group_id, epoch: frame.epoch })?
        };

        epoch.decrypt(frame).inspect_err(|err| {
            tracing::warn!(
                "Dropping group frame {}/{} from {}: {}",
                frame.epoch,
                frame.counter,
                frame.sender.short(),
                err
            );
        })
    }

    /// Prune retired epochs older than the retention period.
    pub fn tick(&mut self, now: I) {
        let retention = self.config.epoch_retention;
        for (group_id, state) in &mut self.groups {
            let before = state.retired.len();
            state.retired.retain(|(_, retired_at)| now - *retired_at < retention);
            if state.retired.len() != before {
                tracing::debug!(
                    "Pruned {} retired epochs of group {}",
                    before - state.retired.len(),
                    group_id
                );
            }
        }
    }

    /// Members of a group's current epoch that have not been handed its key.
    pub fn undelivered(&self, group_id: &GroupId) -> Vec<Fingerprint> {
        self.groups
            .get(group_id)
            .map(|state| state.undelivered.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Retry every owed key copy whose member has a session again.
    ///
    /// Members still unreachable stay owed. Returns how many copies were
    /// handed to the courier.
    pub fn redeliver<C: GroupKeyCourier>(&mut self, courier: &mut C) -> usize {
        let mut delivered = 0;
        for (group_id, state) in &mut self.groups {
            let current = &state.current;
            state.undelivered.retain(|member| {
                if !courier.has_session(member) {
                    return true;
                }
                match courier.deliver(member, current.key_message()) {
                    Ok(()) => {
                        tracing::debug!(
                            "Redelivered group {} epoch {} to {}",
                            group_id,
                            current.epoch,
                            member.short()
                        );
                        delivered += 1;
                        false
                    },
                    Err(_) => true,
                }
            });
        }
        delivered
    }

    /// Forget a group and every key it ever had.
    pub fn remove_group(&mut self, group_id: &GroupId) -> bool {
        let removed = self.groups.remove(group_id).is_some();
        if removed {
            tracing::info!("Left group {}", group_id);
        }
        removed
    }

    /// Number of retired epochs still held for a group.
    pub fn retired_epochs(&self, group_id: &GroupId) -> usize {
        self.groups.get(group_id).map_or(0, |state| state.retired.len())
    }

    fn advance(
        &mut self,
        group_id: &GroupId,
        epoch: GroupEpoch,
        undelivered: BTreeSet<Fingerprint>,
        now: I,
    ) -> &GroupEpoch {
        let max_retired = self.config.max_retired_epochs;
        match self.groups.entry(*group_id) {
            Entry::Occupied(entry) => {
                let state = entry.into_mut();
                let previous = std::mem::replace(&mut state.current, epoch);
                state.undelivered = undelivered;
                state.retired.push_back((previous, now));
                while state.retired.len() > max_retired {
                    state.retired.pop_front();
                }
                &state.current
            },
            Entry::Vacant(entry) => {
                let state = GroupState { current: epoch, retired: VecDeque::new(), undelivered };
                &entry.insert(state).current
            },
        }
    }

    /// Deduplicate, sort and add the local node.
    fn normalize_members(&self, members: &[Fingerprint]) -> Result<Vec<Fingerprint>, GroupError> {
        let mut set: BTreeSet<Fingerprint> = members.iter().copied().collect();
        set.insert(self.local);

        if set.len() < 2 {
            return Err(GroupError::NoMembers);
        }
        if set.len() > MAX_GROUP_MEMBERS {
            return Err(GroupError::TooManyMembers(set.len()));
        }
        Ok(set.into_iter().collect())
    }

    fn check_sessions<C: GroupKeyCourier>(
        &self,
        members: &[Fingerprint],
        courier: &C,
    ) -> Result<(), GroupError> {
        match members.iter().find(|member| **member != self.local && !courier.has_session(member)) {
            Some(missing) => Err(GroupError::NoSession(*missing)),
            None => Ok(()),
        }
    }

    /// Hand a key copy to every member. Returns the members it failed for.
    fn distribute<C: GroupKeyCourier>(
        &self,
        epoch: &GroupEpoch,
        courier: &mut C,
    ) -> BTreeSet<Fingerprint> {
        let mut undelivered = BTreeSet::new();
        for member in epoch.members.iter().filter(|member| **member != self.local) {
            if let Err(err) = courier.deliver(member, epoch.key_message()) {
                tracing::warn!(
                    "Group {} epoch {} key for {} not delivered: {}",
                    epoch.group_id,
                    epoch.epoch,
                    member.short(),
                    err
                );
                undelivered.insert(*member);
            }
        }
        undelivered
    }
}

fn random_key<E: Environment>(env: &E) -> SymmetricKey {
    let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
    env.random_bytes(bytes.as_mut_slice());
    SymmetricKey::from_bytes(*bytes)
}
