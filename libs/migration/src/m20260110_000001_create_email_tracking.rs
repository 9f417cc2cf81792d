use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Create the email_analytics table
        manager
            .create_table(
                Table::create()
                    .table(EmailAnalytics::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(EmailAnalytics::Date).date().not_null())
                    .col(
                        ColumnDef::new(EmailAnalytics::Provider)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EmailAnalytics::TemplateType)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(big_integer(EmailAnalytics::Sent).default(0))
                    .col(big_integer(EmailAnalytics::Delivered).default(0))
                    .col(big_integer(EmailAnalytics::Opened).default(0))
                    .col(big_integer(EmailAnalytics::Clicked).default(0))
                    .col(big_integer(EmailAnalytics::Bounced).default(0))
                    .col(big_integer(EmailAnalytics::Complained).default(0))
                    .col(big_integer(EmailAnalytics::Unsubscribed).default(0))
                    .primary_key(
                        Index::create()
                            .col(EmailAnalytics::Date)
                            .col(EmailAnalytics::Provider)
                            .col(EmailAnalytics::TemplateType),
                    )
                    .to_owned(),
            )
            .await?;

        // Create the email_unsubscribes table
        manager
            .create_table(
                Table::create()
                    .table(EmailUnsubscribes::Table)
                    .if_not_exists()
                    .col(pk_uuid(EmailUnsubscribes::Id))
                    .col(
                        ColumnDef::new(EmailUnsubscribes::Email)
                            .string_len(255)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(EmailUnsubscribes::Token)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EmailUnsubscribes::Reason)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        timestamp_with_time_zone(EmailUnsubscribes::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(EmailUnsubscribes::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_email_unsubscribes_email")
                    .table(EmailUnsubscribes::Table)
                    .col(EmailUnsubscribes::Email)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EmailUnsubscribes::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(EmailAnalytics::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum EmailAnalytics {
    Table,
    Date,
    Provider,
    TemplateType,
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Complained,
    Unsubscribed,
}

#[derive(DeriveIden)]
enum EmailUnsubscribes {
    Table,
    Id,
    Email,
    Token,
    Reason,
    CreatedAt,
    UpdatedAt,
}
