use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260901_000001_create_catalog_tables::Migration),
            Box::new(m20260901_000002_create_cart_tables::Migration),
            Box::new(m20260901_000003_create_order_tables::Migration),
            Box::new(m20260901_000004_create_shipments_table::Migration),
            Box::new(m20260901_000005_create_retry_jobs_table::Migration),
        ]
    }
}

mod m20260901_000001_create_catalog_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260901_000001_create_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(ColumnDef::new(Products::BasePrice).big_integer().not_null())
                        .col(
                            ColumnDef::new(Products::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Offers::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Offers::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Offers::ProductId).uuid().not_null())
                        .col(ColumnDef::new(Offers::DiscountPercent).integer().not_null())
                        .col(
                            ColumnDef::new(Offers::MinQuantity)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(Offers::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Offers::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_offers_product_id")
                        .table(Offers::Table)
                        .col(Offers::ProductId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Offers::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
        Name,
        BasePrice,
        Active,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum Offers {
        Table,
        Id,
        ProductId,
        DiscountPercent,
        MinQuantity,
        Active,
        CreatedAt,
    }
}

mod m20260901_000002_create_cart_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260901_000002_create_cart_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Carts::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Carts::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Carts::UserId).uuid().null())
                        .col(ColumnDef::new(Carts::SessionId).string().null())
                        .col(
                            ColumnDef::new(Carts::ProductCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Carts::TotalPrice)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Carts::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Carts::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_carts_user_id")
                        .table(Carts::Table)
                        .col(Carts::UserId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_carts_session_id")
                        .table(Carts::Table)
                        .col(Carts::SessionId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CartItems::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(CartItems::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(CartItems::CartId).uuid().not_null())
                        .col(ColumnDef::new(CartItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(CartItems::ProductName).string().not_null())
                        .col(ColumnDef::new(CartItems::Size).string().not_null())
                        .col(ColumnDef::new(CartItems::Quantity).integer().not_null())
                        .col(ColumnDef::new(CartItems::UnitPrice).big_integer().not_null())
                        .col(ColumnDef::new(CartItems::LineTotal).big_integer().not_null())
                        .col(
                            ColumnDef::new(CartItems::BaseUnitPrice)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CartItems::OfferId).uuid().null())
                        .col(ColumnDef::new(CartItems::DiscountPercent).integer().null())
                        .col(ColumnDef::new(CartItems::Position).integer().not_null())
                        .col(
                            ColumnDef::new(CartItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CartItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_cart_items_cart_id")
                                .from(CartItems::Table, CartItems::CartId)
                                .to(Carts::Table, Carts::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_cart_items_cart_id")
                        .table(CartItems::Table)
                        .col(CartItems::CartId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Addresses::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Addresses::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Addresses::UserId).uuid().null())
                        .col(ColumnDef::new(Addresses::SessionId).string().null())
                        .col(ColumnDef::new(Addresses::Name).string().not_null())
                        .col(ColumnDef::new(Addresses::Phone).string().not_null())
                        .col(ColumnDef::new(Addresses::Email).string().null())
                        .col(ColumnDef::new(Addresses::Line1).string().not_null())
                        .col(ColumnDef::new(Addresses::Line2).string().null())
                        .col(ColumnDef::new(Addresses::City).string().not_null())
                        .col(ColumnDef::new(Addresses::State).string().not_null())
                        .col(ColumnDef::new(Addresses::Pincode).string().not_null())
                        .col(ColumnDef::new(Addresses::Country).string().not_null())
                        .col(
                            ColumnDef::new(Addresses::IsDefault)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Addresses::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Addresses::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(CartItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Carts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Carts {
        Table,
        Id,
        UserId,
        SessionId,
        ProductCount,
        TotalPrice,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum CartItems {
        Table,
        Id,
        CartId,
        ProductId,
        ProductName,
        Size,
        Quantity,
        UnitPrice,
        LineTotal,
        BaseUnitPrice,
        OfferId,
        DiscountPercent,
        Position,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Addresses {
        Table,
        Id,
        UserId,
        SessionId,
        Name,
        Phone,
        Email,
        Line1,
        Line2,
        City,
        State,
        Pincode,
        Country,
        IsDefault,
        CreatedAt,
    }
}

mod m20260901_000003_create_order_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260901_000003_create_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().not_null().primary_key())
                        .col(
                            ColumnDef::new(Orders::OrderNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Orders::UserId).uuid().null())
                        .col(ColumnDef::new(Orders::SessionId).string().null())
                        .col(ColumnDef::new(Orders::CartId).uuid().not_null())
                        .col(ColumnDef::new(Orders::Status).string_len(32).not_null())
                        .col(ColumnDef::new(Orders::PaymentMethod).string_len(16).not_null())
                        .col(ColumnDef::new(Orders::TotalAmount).big_integer().not_null())
                        .col(ColumnDef::new(Orders::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Orders::ProductIds).json().not_null())
                        .col(ColumnDef::new(Orders::ProductCount).integer().not_null())
                        .col(ColumnDef::new(Orders::LineItems).json().not_null())
                        .col(ColumnDef::new(Orders::CarrierOrderRef).string().null())
                        .col(ColumnDef::new(Orders::GatewayOrderId).string().null())
                        .col(ColumnDef::new(Orders::GatewayPaymentId).string().null())
                        .col(
                            ColumnDef::new(Orders::ShipmentClaimedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Orders::IssuedShipment).json().null())
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_status")
                        .table(Orders::Table)
                        .col(Orders::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Payments::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Payments::Id).uuid().not_null().primary_key())
                        .col(
                            ColumnDef::new(Payments::OrderId)
                                .uuid()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Payments::Amount).big_integer().not_null())
                        .col(ColumnDef::new(Payments::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Payments::Method).string_len(16).not_null())
                        .col(ColumnDef::new(Payments::Status).string_len(16).not_null())
                        .col(ColumnDef::new(Payments::GatewayOrderId).string().null())
                        .col(ColumnDef::new(Payments::GatewayPaymentId).string().null())
                        .col(ColumnDef::new(Payments::FailureReason).string().null())
                        .col(
                            ColumnDef::new(Payments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payments_order_id")
                                .from(Payments::Table, Payments::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderSequences::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderSequences::SeqDate)
                                .string_len(8)
                                .not_null()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(OrderSequences::LastValue)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderSequences::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Payments::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
        OrderNumber,
        UserId,
        SessionId,
        CartId,
        Status,
        PaymentMethod,
        TotalAmount,
        Currency,
        ProductIds,
        ProductCount,
        LineItems,
        CarrierOrderRef,
        GatewayOrderId,
        GatewayPaymentId,
        ShipmentClaimedAt,
        IssuedShipment,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Payments {
        Table,
        Id,
        OrderId,
        Amount,
        Currency,
        Method,
        Status,
        GatewayOrderId,
        GatewayPaymentId,
        FailureReason,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum OrderSequences {
        Table,
        SeqDate,
        LastValue,
    }
}

mod m20260901_000004_create_shipments_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260901_000004_create_shipments_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Shipments::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Shipments::Id).uuid().not_null().primary_key())
                        .col(
                            ColumnDef::new(Shipments::OrderId)
                                .uuid()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Shipments::OrderNumber).string().not_null())
                        .col(ColumnDef::new(Shipments::CarrierOrderRef).string().not_null())
                        .col(
                            ColumnDef::new(Shipments::Waybill)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Shipments::Consignee).json().not_null())
                        .col(ColumnDef::new(Shipments::PaymentMode).string_len(16).not_null())
                        .col(
                            ColumnDef::new(Shipments::CodAmount)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Shipments::WeightGrams).integer().not_null())
                        .col(ColumnDef::new(Shipments::PackageTier).string_len(8).not_null())
                        .col(ColumnDef::new(Shipments::LengthCm).integer().not_null())
                        .col(ColumnDef::new(Shipments::BreadthCm).integer().not_null())
                        .col(ColumnDef::new(Shipments::HeightCm).integer().not_null())
                        .col(
                            ColumnDef::new(Shipments::ProductsDescription)
                                .text()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Shipments::LineItems).json().not_null())
                        .col(ColumnDef::new(Shipments::CarrierStatus).string().null())
                        .col(ColumnDef::new(Shipments::SortCode).string().null())
                        .col(
                            ColumnDef::new(Shipments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Shipments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_shipments_order_number")
                        .table(Shipments::Table)
                        .col(Shipments::OrderNumber)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Shipments::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Shipments {
        Table,
        Id,
        OrderId,
        OrderNumber,
        CarrierOrderRef,
        Waybill,
        Consignee,
        PaymentMode,
        CodAmount,
        WeightGrams,
        PackageTier,
        LengthCm,
        BreadthCm,
        HeightCm,
        ProductsDescription,
        LineItems,
        CarrierStatus,
        SortCode,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20260901_000005_create_retry_jobs_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260901_000005_create_retry_jobs_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(RetryJobs::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(RetryJobs::Id).uuid().not_null().primary_key())
                        .col(
                            ColumnDef::new(RetryJobs::DedupeKey)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(RetryJobs::JobType).string_len(64).not_null())
                        .col(ColumnDef::new(RetryJobs::Payload).json().not_null())
                        .col(ColumnDef::new(RetryJobs::Status).string_len(16).not_null())
                        .col(
                            ColumnDef::new(RetryJobs::Attempts)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(RetryJobs::MaxAttempts).integer().not_null())
                        .col(
                            ColumnDef::new(RetryJobs::NextRetryAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(RetryJobs::LockedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(RetryJobs::LockedBy).string().null())
                        .col(ColumnDef::new(RetryJobs::LastError).text().null())
                        .col(
                            ColumnDef::new(RetryJobs::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(RetryJobs::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_retry_jobs_status_next_retry_at")
                        .table(RetryJobs::Table)
                        .col(RetryJobs::Status)
                        .col(RetryJobs::NextRetryAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(RetryJobs::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum RetryJobs {
        Table,
        Id,
        DedupeKey,
        JobType,
        Payload,
        Status,
        Attempts,
        MaxAttempts,
        NextRetryAt,
        LockedAt,
        LockedBy,
        LastError,
        CreatedAt,
        UpdatedAt,
    }
}
