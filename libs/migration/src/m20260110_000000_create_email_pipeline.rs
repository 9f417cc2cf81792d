use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Create the email_logs table
        manager
            .create_table(
                Table::create()
                    .table(EmailLogs::Table)
                    .if_not_exists()
                    .col(pk_uuid(EmailLogs::Id))
                    .col(ColumnDef::new(EmailLogs::UserId).uuid().null())
                    .col(
                        ColumnDef::new(EmailLogs::TemplateId)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EmailLogs::Recipients)
                            .array(ColumnType::Text)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EmailLogs::FromAddress)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EmailLogs::Subject)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(text(EmailLogs::HtmlBody))
                    .col(text(EmailLogs::TextBody))
                    .col(
                        ColumnDef::new(EmailLogs::Status)
                            .string_len(32)
                            .not_null()
                            .default("queued"),
                    )
                    .col(ColumnDef::new(EmailLogs::Provider).string_len(64).null())
                    .col(text_null(EmailLogs::ProviderMessageId))
                    .col(timestamp_with_time_zone_null(EmailLogs::ScheduledAt))
                    .col(timestamp_with_time_zone_null(EmailLogs::SentAt))
                    .col(timestamp_with_time_zone_null(EmailLogs::DeliveredAt))
                    .col(timestamp_with_time_zone_null(EmailLogs::OpenedAt))
                    .col(timestamp_with_time_zone_null(EmailLogs::ClickedAt))
                    .col(timestamp_with_time_zone_null(EmailLogs::BouncedAt))
                    .col(timestamp_with_time_zone_null(EmailLogs::ComplainedAt))
                    .col(timestamp_with_time_zone_null(EmailLogs::UnsubscribedAt))
                    .col(text_null(EmailLogs::ErrorMessage))
                    .col(
                        ColumnDef::new(EmailLogs::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(EmailLogs::MaxAttempts)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(EmailLogs::Priority)
                            .integer()
                            .not_null()
                            .default(100),
                    )
                    .col(
                        ColumnDef::new(EmailLogs::Metadata)
                            .json_binary()
                            .not_null()
                            .default(Expr::cust("'{}'::jsonb")),
                    )
                    .col(
                        timestamp_with_time_zone(EmailLogs::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Create the email_queue table
        manager
            .create_table(
                Table::create()
                    .table(EmailQueue::Table)
                    .if_not_exists()
                    .col(pk_uuid(EmailQueue::Id))
                    .col(
                        ColumnDef::new(EmailQueue::MessageId)
                            .uuid()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(EmailQueue::Status)
                            .string_len(32)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(EmailQueue::Priority)
                            .integer()
                            .not_null()
                            .default(100),
                    )
                    .col(
                        ColumnDef::new(EmailQueue::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(EmailQueue::MaxAttempts)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(EmailQueue::NextRetryAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(timestamp_with_time_zone_null(EmailQueue::LastAttemptAt))
                    .col(
                        timestamp_with_time_zone(EmailQueue::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_email_queue_message")
                            .from(EmailQueue::Table, EmailQueue::MessageId)
                            .to(EmailLogs::Table, EmailLogs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create the email_providers table
        manager
            .create_table(
                Table::create()
                    .table(EmailProviders::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EmailProviders::Name)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(EmailProviders::Kind)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EmailProviders::Credentials)
                            .json_binary()
                            .not_null()
                            .default(Expr::cust("'{}'::jsonb")),
                    )
                    .col(
                        ColumnDef::new(EmailProviders::Priority)
                            .integer()
                            .not_null()
                            .default(100),
                    )
                    .col(
                        ColumnDef::new(EmailProviders::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .to_owned(),
            )
            .await?;

        // Create indexes
        manager
            .create_index(
                Index::create()
                    .name("idx_email_logs_status")
                    .table(EmailLogs::Table)
                    .col(EmailLogs::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_email_logs_provider_message_id")
                    .table(EmailLogs::Table)
                    .col(EmailLogs::ProviderMessageId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_email_logs_created_at")
                    .table(EmailLogs::Table)
                    .col(EmailLogs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        // The claim scan filters on status and due time, then orders by
        // priority and age.
        manager
            .create_index(
                Index::create()
                    .name("idx_email_queue_status_next_retry_at")
                    .table(EmailQueue::Table)
                    .col(EmailQueue::Status)
                    .col(EmailQueue::NextRetryAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_email_queue_priority_created_at")
                    .table(EmailQueue::Table)
                    .col(EmailQueue::Priority)
                    .col(EmailQueue::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_email_providers_priority")
                    .table(EmailProviders::Table)
                    .col(EmailProviders::Priority)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EmailProviders::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(EmailQueue::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(EmailLogs::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum EmailLogs {
    Table,
    Id,
    UserId,
    TemplateId,
    Recipients,
    FromAddress,
    Subject,
    HtmlBody,
    TextBody,
    Status,
    Provider,
    ProviderMessageId,
    ScheduledAt,
    SentAt,
    DeliveredAt,
    OpenedAt,
    ClickedAt,
    BouncedAt,
    ComplainedAt,
    UnsubscribedAt,
    ErrorMessage,
    Attempts,
    MaxAttempts,
    Priority,
    Metadata,
    CreatedAt,
}

#[derive(DeriveIden)]
enum EmailQueue {
    Table,
    Id,
    MessageId,
    Status,
    Priority,
    Attempts,
    MaxAttempts,
    NextRetryAt,
    LastAttemptAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum EmailProviders {
    Table,
    Name,
    Kind,
    Credentials,
    Priority,
    IsActive,
}
