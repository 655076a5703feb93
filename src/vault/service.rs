use std::sync::Arc;

use crate::auth::AuthSession;
use crate::error::{VaultError, VaultResult};
use crate::vault::models::ssh::{CreateSshProfileRequest, UpdateSshProfileRequest};
use crate::vault::models::{
    SavedCommand, SavedCommandGroup, SshGroup, SshKey, SshProfile,
};
use crate::vault::VaultStore;

/// The vault operation surface a front-end talks to. Every call counts as
/// activity for the auto-lock timer.
pub struct VaultService {
    store: Arc<VaultStore>,
    auth: Arc<AuthSession>,
}

impl VaultService {
    pub fn new(store: Arc<VaultStore>, auth: Arc<AuthSession>) -> Self {
        Self { store, auth }
    }

    pub fn store(&self) -> &Arc<VaultStore> {
        &self.store
    }

    async fn touch(&self) {
        self.auth.touch_activity().await;
    }

    // ---- SSH profiles ----

    pub async fn create_ssh_profile(
        &self,
        request: CreateSshProfileRequest,
    ) -> VaultResult<SshProfile> {
        self.touch().await;
        let device_id = self.store.current_device_id().await?;
        let mut profile = request.into_profile(device_id);
        self.store.save_ssh_profile(&mut profile).await?;
        Ok(profile)
    }

    pub async fn get_ssh_profile(&self, id: &str) -> VaultResult<SshProfile> {
        self.touch().await;
        self.store.get_ssh_profile(id).await
    }

    pub async fn get_ssh_profiles(&self) -> VaultResult<Vec<SshProfile>> {
        self.touch().await;
        self.store.list_ssh_profiles().await
    }

    pub async fn update_ssh_profile(
        &self,
        id: &str,
        request: UpdateSshProfileRequest,
    ) -> VaultResult<SshProfile> {
        self.touch().await;
        let mut profile = self.store.get_ssh_profile(id).await?;
        request.apply(&mut profile);
        self.store.save_ssh_profile(&mut profile).await?;
        Ok(profile)
    }

    pub async fn delete_ssh_profile(&self, id: &str) -> VaultResult<()> {
        self.touch().await;
        self.store.delete_ssh_profile(id).await
    }

    pub async fn move_profile_to_group(
        &self,
        profile_id: &str,
        group_id: Option<String>,
    ) -> VaultResult<SshProfile> {
        self.touch().await;
        if let Some(group_id) = &group_id {
            // Referential sanity before the write.
            self.store.get_ssh_group(group_id).await?;
        }
        self.store.move_profile_to_group(profile_id, group_id).await
    }

    pub async fn duplicate_ssh_profile(&self, profile_id: &str) -> VaultResult<SshProfile> {
        self.touch().await;
        self.store.duplicate_ssh_profile(profile_id).await
    }

    // ---- SSH groups ----

    pub async fn create_ssh_group(
        &self,
        name: String,
        description: Option<String>,
        color: Option<String>,
    ) -> VaultResult<SshGroup> {
        self.touch().await;
        if name.trim().is_empty() {
            return Err(VaultError::ConstraintViolation(
                "group name cannot be empty".into(),
            ));
        }
        let device_id = self.store.current_device_id().await?;
        let mut group = SshGroup::new(device_id, name);
        group.description = description;
        group.color = color;
        self.store.save_ssh_group(&mut group).await?;
        Ok(group)
    }

    pub async fn get_ssh_groups(&self) -> VaultResult<Vec<SshGroup>> {
        self.touch().await;
        self.store.list_ssh_groups().await
    }

    pub async fn update_ssh_group(&self, group: &mut SshGroup) -> VaultResult<()> {
        self.touch().await;
        group.base.touch();
        self.store.save_ssh_group(group).await
    }

    pub async fn delete_ssh_group(&self, id: &str) -> VaultResult<()> {
        self.touch().await;
        self.store.delete_ssh_group(id).await
    }

    // ---- SSH keys ----

    pub async fn create_ssh_key(
        &self,
        name: String,
        private_key: String,
        public_key: Option<String>,
        passphrase: Option<String>,
    ) -> VaultResult<SshKey> {
        self.touch().await;
        let device_id = self.store.current_device_id().await?;
        let mut key = SshKey::new(device_id, name, private_key, public_key, passphrase);
        self.store.save_ssh_key(&mut key).await?;
        Ok(key)
    }

    pub async fn get_ssh_key(&self, id: &str) -> VaultResult<SshKey> {
        self.touch().await;
        self.store.get_ssh_key(id).await
    }

    pub async fn get_ssh_keys(&self) -> VaultResult<Vec<SshKey>> {
        self.touch().await;
        self.store.list_ssh_keys().await
    }

    pub async fn delete_ssh_key(&self, id: &str) -> VaultResult<()> {
        self.touch().await;
        self.store.delete_ssh_key(id).await
    }

    // ---- saved commands ----

    pub async fn create_saved_command(
        &self,
        name: String,
        command: String,
        description: Option<String>,
        tags: Vec<String>,
        group_id: Option<String>,
    ) -> VaultResult<SavedCommand> {
        self.touch().await;
        let device_id = self.store.current_device_id().await?;
        let mut saved = SavedCommand::new(device_id, name, command);
        saved.description = description;
        saved.tags = tags;
        saved.group_id = group_id;
        self.store.save_saved_command(&mut saved).await?;
        Ok(saved)
    }

    pub async fn get_saved_commands(&self) -> VaultResult<Vec<SavedCommand>> {
        self.touch().await;
        self.store.list_saved_commands().await
    }

    pub async fn update_saved_command(&self, command: &mut SavedCommand) -> VaultResult<()> {
        self.touch().await;
        command.base.touch();
        self.store.save_saved_command(command).await
    }

    pub async fn delete_saved_command(&self, id: &str) -> VaultResult<()> {
        self.touch().await;
        self.store.delete_saved_command(id).await
    }

    pub async fn increment_command_usage(&self, id: &str) -> VaultResult<()> {
        self.store.increment_command_usage(id).await
    }

    pub async fn toggle_command_favorite(&self, id: &str) -> VaultResult<SavedCommand> {
        self.touch().await;
        self.store.toggle_command_favorite(id).await
    }

    pub async fn create_saved_command_group(
        &self,
        name: String,
        description: Option<String>,
        color: Option<String>,
    ) -> VaultResult<SavedCommandGroup> {
        self.touch().await;
        let device_id = self.store.current_device_id().await?;
        let mut group = SavedCommandGroup::new(device_id, name);
        group.description = description;
        group.color = color;
        self.store.save_saved_command_group(&mut group).await?;
        Ok(group)
    }

    pub async fn get_saved_command_groups(&self) -> VaultResult<Vec<SavedCommandGroup>> {
        self.touch().await;
        self.store.list_saved_command_groups().await
    }

    pub async fn delete_saved_command_group(&self, id: &str) -> VaultResult<()> {
        self.touch().await;
        self.store.delete_saved_command_group(id).await
    }
}
