use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use server_api::JwtAuthority;
use shared::domain::{GroupId, MessageId, RoomId, UserId};
use storage::Storage;

/// Operator utilities for the relay database.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/relay.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
        #[arg(long)]
        name: Option<String>,
    },
    CreateGroup {
        admin_user_id: i64,
        name: String,
        /// Additional members besides the admin.
        #[arg(long = "member")]
        members: Vec<i64>,
    },
    AddMember {
        group_id: i64,
        user_id: i64,
    },
    RemoveMember {
        group_id: i64,
        user_id: i64,
    },
    /// Issues a bearer token for an existing user.
    MintToken {
        user_id: i64,
        #[arg(long, env = "JWT_SECRET", default_value = "dev-relay-secret")]
        secret: String,
        #[arg(long, default_value_t = 3600)]
        ttl_seconds: i64,
    },
    /// Prints stored history of a room, e.g. `5` or `1_2`.
    History {
        room: RoomId,
        #[arg(long)]
        after: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser { username, name } => {
            let user_id = storage
                .create_user(&username, name.as_deref().unwrap_or_default())
                .await?;
            println!("created user_id={user_id}");
        }
        Command::CreateGroup {
            admin_user_id,
            name,
            members,
        } => {
            let members: Vec<UserId> = members.into_iter().map(UserId).collect();
            let group_id = storage
                .create_group(&name, UserId(admin_user_id), &members)
                .await?;
            println!("created group_id={group_id}");
        }
        Command::AddMember { group_id, user_id } => {
            storage
                .add_group_member(GroupId(group_id), UserId(user_id))
                .await?;
            println!("added user_id={user_id} to group_id={group_id}");
        }
        Command::RemoveMember { group_id, user_id } => {
            let removed = storage
                .remove_group_member(GroupId(group_id), UserId(user_id))
                .await?;
            if !removed {
                bail!("user_id={user_id} is not a member of group_id={group_id}");
            }
            println!("removed user_id={user_id} from group_id={group_id}");
        }
        Command::MintToken {
            user_id,
            secret,
            ttl_seconds,
        } => {
            let user_id = UserId(user_id);
            if storage.user(user_id).await?.is_none() {
                bail!("user_id={user_id} does not exist");
            }
            let token = JwtAuthority::new(secret, ttl_seconds).mint(user_id)?;
            println!("{token}");
        }
        Command::History { room, after } => {
            for message in storage
                .list_room_messages(room, after.map(MessageId))
                .await?
            {
                println!(
                    "{} [{}] user {}: {}",
                    message.message_id, message.status, message.sender_id, message.content
                );
            }
        }
    }

    Ok(())
}
